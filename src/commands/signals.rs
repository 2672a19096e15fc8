//! Interrupt handling for `run`: SIGINT/SIGTERM only set flags; a watcher thread turns them
//! into an exit deadline on the running session and forwards SIGINT to the server.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nailgun_runner::ClientCanceller;
use tracing::{debug, warn};

/// How long the server gets to exit after the first interrupt.
pub(crate) const INTERRUPT_GRACE: Duration = Duration::from_secs(5);
const WATCH_INTERVAL: Duration = Duration::from_millis(50);

static INTERRUPTS: AtomicU32 = AtomicU32::new(0);

extern "C" fn handle_interrupt(_sig: i32) {
    INTERRUPTS.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn install_signal_handlers() {
    let act = SigAction::new(
        SigHandler::Handler(handle_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        if let Err(e) = signal::sigaction(Signal::SIGINT, &act) {
            warn!("failed to install SIGINT handler: {e}");
        }
        if let Err(e) = signal::sigaction(Signal::SIGTERM, &act) {
            warn!("failed to install SIGTERM handler: {e}");
        }
    }
}

/// Stop the watcher and wait for it on drop.
pub(crate) struct InterruptWatcher {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InterruptWatcher {
    pub(crate) fn start(canceller: ClientCanceller) -> std::io::Result<Self> {
        let done = Arc::new(AtomicBool::new(false));
        let done_cl = done.clone();
        let handle = std::thread::Builder::new()
            .name("nailgun-interrupts".to_string())
            .spawn(move || watch(&canceller, &done_cl, &INTERRUPTS))?;
        Ok(Self {
            done,
            handle: Some(handle),
        })
    }
}

impl Drop for InterruptWatcher {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn watch(canceller: &ClientCanceller, done: &AtomicBool, counter: &AtomicU32) {
    let mut seen = 0;
    while !done.load(Ordering::SeqCst) {
        let now = counter.load(Ordering::SeqCst);
        if now > seen {
            seen = now;
            if seen == 1 {
                debug!("interrupted; asking nailgun server to stop within {INTERRUPT_GRACE:?}");
                canceller.set_exit_timeout(INTERRUPT_GRACE, "interrupted by user");
                canceller.maybe_send_signal(Signal::SIGINT);
            } else {
                canceller.set_exit_timeout(Duration::ZERO, "interrupted by user (repeated)");
            }
        }
        std::thread::sleep(WATCH_INTERVAL);
    }
}
