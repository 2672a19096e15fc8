//! Stdin relay: forwards a local input source to the server as STDIN chunks on a
//! background thread, finishing with a single STDIN_EOF chunk.
//!
//! Behavior
//! - Started only after the server sends START_READING_INPUT.
//! - `stop()` asks the thread to finish and joins it; the input is read with a bounded
//!   wait (see `PolledFd`) so the stop flag is observed within one poll interval.
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};

use crate::protocol::{write_chunk, ChunkType};

/// Input shared between a long-lived client and the relay thread of each session.
pub type SharedInput = Arc<Mutex<Box<dyn Read + Send>>>;

pub const RELAY_BUF_SIZE: usize = 8192;

pub fn shared_input<R: Read + Send + 'static>(reader: R) -> SharedInput {
    Arc::new(Mutex::new(Box::new(reader)))
}

/// Unbuffered reader over a file descriptor that waits at most `interval` for data and
/// reports `TimedOut` when none arrived.
#[derive(Debug)]
pub struct PolledFd {
    file: File,
    interval: Duration,
}

impl PolledFd {
    pub fn new(file: File, interval: Duration) -> Self {
        Self { file, interval }
    }

    /// A private duplicate of this process's stdin.
    pub fn stdin(interval: Duration) -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::new(File::from(fd), interval))
    }
}

impl Read for PolledFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let millis = u16::try_from(self.interval.as_millis()).unwrap_or(u16::MAX);
        let ready = {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(millis)).map_err(io::Error::from)?
        };
        if ready == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no input ready"));
        }
        self.file.read(buf)
    }
}

#[derive(Debug)]
pub struct StreamRelay {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamRelay {
    pub fn start<W: Write + Send + 'static>(input: SharedInput, sink: W) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_cl = running.clone();
        let handle = std::thread::Builder::new()
            .name("nailgun-stdin".to_string())
            .spawn(move || relay_loop(&input, sink, &running_cl))?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("nailgun stdin relay thread panicked");
            }
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

fn relay_loop<W: Write>(input: &SharedInput, mut sink: W, running: &AtomicBool) {
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    while running.load(Ordering::SeqCst) {
        let read = {
            let mut guard = input.lock().unwrap_or_else(|p| p.into_inner());
            guard.read(&mut buf)
        };
        match read {
            Ok(0) => {
                if let Err(e) = write_chunk(&mut sink, ChunkType::StdinEof, b"") {
                    debug!("failed to send stdin eof: {e}");
                }
                return;
            }
            Ok(n) => {
                if let Err(e) = write_chunk(&mut sink, ChunkType::Stdin, &buf[..n]) {
                    debug!("stdin relay stopped, server went away: {e}");
                    return;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                warn!("failed to read local input, closing remote stdin: {e}");
                let _ = write_chunk(&mut sink, ChunkType::StdinEof, b"");
                return;
            }
        }
    }
    debug!("nailgun stdin relay stopped before input was exhausted");
}
