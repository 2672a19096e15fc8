//! One request/response exchange over an open connection.
//!
//! Cancellation: another thread may arm an exit timeout (deadline + reason) on the
//! session's `ExitTimeoutToken`. The socket read timeout is a short polling interval, so
//! the chunk reader notices an armed deadline within one interval. A reason, when set, is
//! raised after the relay has been stopped and the socket shut down, and it replaces
//! whatever error the exchange itself produced.
use std::collections::BTreeMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::relay::{SharedInput, StreamRelay};
use crate::errors::{ProtocolError, StreamError};
use crate::protocol::{
    decode_exit_code, read_chunk, send_request, ChunkType, TimeoutProvider,
};

/// Path separator advertised to the server for the client platform.
pub const PATH_SEPARATOR_ENV: &str = "NAILGUN_PATHSEPARATOR";
/// File separator advertised to the server for the client platform.
pub const FILE_SEPARATOR_ENV: &str = "NAILGUN_FILESEPARATOR";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct ExitTimeout {
    deadline: Instant,
    reason: String,
}

/// Deadline and reason shared between a running session and whoever wants to stop it.
#[derive(Debug, Clone, Default)]
pub struct ExitTimeoutToken(Arc<Mutex<Option<ExitTimeout>>>);

impl ExitTimeoutToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the deadline; `timeout` is measured from now.
    pub fn set(&self, timeout: Duration, reason: impl Into<String>) {
        let mut slot = self.0.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(ExitTimeout {
            deadline: Instant::now() + timeout,
            reason: reason.into(),
        });
    }

    pub fn reason(&self) -> Option<String> {
        let slot = self.0.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_ref().map(|t| t.reason.clone())
    }
}

impl TimeoutProvider for ExitTimeoutToken {
    fn deadline(&self) -> Option<Instant> {
        let slot = self.0.lock().unwrap_or_else(|p| p.into_inner());
        slot.as_ref().map(|t| t.deadline)
    }
}

/// Interop variables every request carries; values supplied by the caller win.
pub fn interop_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(PATH_SEPARATOR_ENV.to_string(), ":".to_string());
    env.insert(FILE_SEPARATOR_ENV.to_string(), "/".to_string());
    env
}

pub struct NailgunSession<'a> {
    sock: TcpStream,
    input: Option<SharedInput>,
    stdout: &'a mut (dyn Write + Send),
    stderr: &'a mut (dyn Write + Send),
    exit_timeout: ExitTimeoutToken,
    poll_interval: Duration,
    relay: Option<StreamRelay>,
}

impl<'a> NailgunSession<'a> {
    pub fn new(
        sock: TcpStream,
        input: Option<SharedInput>,
        stdout: &'a mut (dyn Write + Send),
        stderr: &'a mut (dyn Write + Send),
    ) -> Self {
        Self {
            sock,
            input,
            stdout,
            stderr,
            exit_timeout: ExitTimeoutToken::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            relay: None,
        }
    }

    /// Share an externally held token so another thread can stop this session.
    pub fn with_exit_timeout(mut self, token: ExitTimeoutToken) -> Self {
        self.exit_timeout = token;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn exit_timeout_token(&self) -> ExitTimeoutToken {
        self.exit_timeout.clone()
    }

    pub fn set_exit_timeout(&self, timeout: Duration, reason: impl Into<String>) {
        self.exit_timeout.set(timeout, reason);
    }

    /// Send the request header and process the response stream until EXIT.
    pub fn execute(
        &mut self,
        working_dir: &str,
        main_class: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<i32, StreamError> {
        let mut environment = interop_env();
        environment.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let result = self.exchange(working_dir, main_class, args, &environment);
        if let Err(StreamError::Timeout(ref t)) = result {
            warn!("nailgun session exceeded its exit deadline (overtime {:?})", t.overtime);
        }

        self.maybe_stop_relay();
        let _ = self.sock.shutdown(Shutdown::Both);

        if let Some(reason) = self.exit_timeout.reason() {
            debug!("nailgun session cancelled: {reason}");
            return Err(StreamError::Cancelled(reason));
        }
        result
    }

    fn exchange(
        &mut self,
        working_dir: &str,
        main_class: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<i32, StreamError> {
        self.sock.set_read_timeout(Some(self.poll_interval))?;
        send_request(&mut self.sock, working_dir, main_class, args, env)?;
        debug!(
            "sent nailgun request: {} ({} args, {} env) in {}",
            main_class,
            args.len(),
            env.len(),
            working_dir
        );
        self.process_session()
    }

    fn process_session(&mut self) -> Result<i32, StreamError> {
        loop {
            let (chunk_type, payload) = read_chunk(&mut self.sock, &self.exit_timeout)?;
            match chunk_type {
                ChunkType::Stdout => {
                    self.stdout.write_all(&payload)?;
                    self.stdout.flush()?;
                }
                ChunkType::Stderr => {
                    self.stderr.write_all(&payload)?;
                    self.stderr.flush()?;
                }
                ChunkType::Exit => {
                    self.stdout.flush()?;
                    self.stderr.flush()?;
                    return Ok(decode_exit_code(&payload)?);
                }
                ChunkType::StartReadingInput => self.maybe_start_relay()?,
                other => {
                    return Err(ProtocolError::UnexpectedChunk {
                        chunk_type: other,
                        payload: String::from_utf8_lossy(&payload).into_owned(),
                    }
                    .into())
                }
            }
        }
    }

    fn maybe_start_relay(&mut self) -> Result<(), StreamError> {
        if self.relay.is_some() {
            return Ok(());
        }
        if let Some(input) = self.input.clone() {
            let sink = self.sock.try_clone()?;
            self.relay = Some(StreamRelay::start(input, sink)?);
            debug!("started nailgun stdin relay");
        }
        Ok(())
    }

    fn maybe_stop_relay(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            relay.stop();
        }
    }
}

impl Drop for NailgunSession<'_> {
    fn drop(&mut self) {
        self.maybe_stop_relay();
    }
}
