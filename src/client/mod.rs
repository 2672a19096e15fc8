/*!
Nailgun client: connects to a server, runs one main class per connection and relays the
process's stdio.

A client is long lived and reusable; each `execute` opens a fresh connection and a fresh
session. While a session is running, `set_exit_timeout` and `maybe_send_signal` may be
called from another thread through a `ClientCanceller`.
*/
pub mod relay;
pub mod session;

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::errors::{NailgunError, StreamError};
use crate::protocol::ttynames_to_env;
pub use relay::{shared_input, PolledFd, SharedInput, StreamRelay};
pub use session::{
    interop_env, ExitTimeoutToken, NailgunSession, FILE_SEPARATOR_ENV, PATH_SEPARATOR_ENV,
};

pub const DEFAULT_NG_HOST: &str = "127.0.0.1";
pub const DEFAULT_NG_PORT: u16 = 2113;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STDIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Local endpoints of the remote process's stdio.
pub struct NailgunStdio {
    pub stdin: Option<SharedInput>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
    /// NAILGUN_TTY_PATH_* entries describing which local streams are terminals.
    pub tty_env: BTreeMap<String, String>,
}

impl NailgunStdio {
    pub fn new(
        stdin: Option<Box<dyn Read + Send>>,
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            stdin: stdin.map(|r| Arc::new(Mutex::new(r))),
            stdout,
            stderr,
            tty_env: BTreeMap::new(),
        }
    }

    /// This process's own stdio. Stdin is polled so a finished session can stop its relay.
    pub fn inherit() -> io::Result<Self> {
        let stdin: Box<dyn Read + Send> = Box::new(PolledFd::stdin(STDIN_POLL_INTERVAL)?);
        Ok(Self {
            stdin: Some(Arc::new(Mutex::new(stdin))),
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
            tty_env: ttynames_to_env(),
        })
    }
}

type SessionSlot = Arc<Mutex<Option<ExitTimeoutToken>>>;

/// Cloneable handle for stopping whatever the owning client is currently running.
#[derive(Debug, Clone)]
pub struct ClientCanceller {
    current: SessionSlot,
    remote_pid: Option<u32>,
}

impl ClientCanceller {
    /// Arm the exit deadline of the running session; no-op when nothing is running.
    pub fn set_exit_timeout(&self, timeout: Duration, reason: &str) {
        set_exit_timeout_in(&self.current, timeout, reason);
    }

    /// Deliver `signal` to the server process when its pid is known.
    pub fn maybe_send_signal(&self, signal: Signal) {
        send_signal_to(self.remote_pid, signal);
    }
}

fn set_exit_timeout_in(slot: &SessionSlot, timeout: Duration, reason: &str) {
    let guard = slot.lock().unwrap_or_else(|p| p.into_inner());
    match guard.as_ref() {
        Some(token) => token.set(timeout, reason),
        None => debug!("no running nailgun session; ignoring exit timeout ({reason})"),
    }
}

fn send_signal_to(remote_pid: Option<u32>, signal: Signal) {
    let Some(pid) = remote_pid else {
        debug!("remote nailgun pid unknown; not sending {signal}");
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) => info!("sent {signal} to nailgun server pid {pid}"),
        Err(e) => warn!("failed to send {signal} to nailgun server pid {pid}: {e}"),
    }
}

pub struct NailgunClient {
    host: String,
    port: u16,
    stdio: NailgunStdio,
    workdir: Option<PathBuf>,
    connect_timeout: Duration,
    remote_pid: Option<u32>,
    current: SessionSlot,
}

impl NailgunClient {
    pub fn new(host: impl Into<String>, port: u16, stdio: NailgunStdio) -> Self {
        Self {
            host: host.into(),
            port,
            stdio,
            workdir: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            remote_pid: None,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_remote_pid(mut self, pid: Option<u32>) -> Self {
        self.remote_pid = pid;
        self
    }

    /// Directory used when `execute` is called without an explicit cwd.
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn remote_pid(&self) -> Option<u32> {
        self.remote_pid
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn canceller(&self) -> ClientCanceller {
        ClientCanceller {
            current: self.current.clone(),
            remote_pid: self.remote_pid,
        }
    }

    /// Open a connection to the server, trying every address the host resolves to.
    pub fn try_connect(&self) -> Result<TcpStream, NailgunError> {
        let address = self.address();
        let conn_err = |source: io::Error| NailgunError::Connection {
            address: address.clone(),
            source,
        };
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(conn_err)?;
        let mut last_err =
            io::Error::new(io::ErrorKind::AddrNotAvailable, "host resolved to no addresses");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(sock) => {
                    debug!("connected to nailgun server at {addr}");
                    return Ok(sock);
                }
                Err(e) => last_err = e,
            }
        }
        Err(conn_err(last_err))
    }

    /// Run `main_class` on the server and return its exit code.
    pub fn execute(
        &mut self,
        main_class: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<i32, NailgunError> {
        let address = self.address();
        let working_dir = match cwd.map(Path::to_path_buf).or_else(|| self.workdir.clone()) {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map_err(|source| NailgunError::WorkingDirectory { source })?,
        };
        let sock = self.try_connect()?;

        let mut environment = self.stdio.tty_env.clone();
        environment.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let token = ExitTimeoutToken::new();
        self.set_current(Some(token.clone()));
        let result = {
            let stdio = &mut self.stdio;
            let mut session = NailgunSession::new(
                sock,
                stdio.stdin.clone(),
                &mut *stdio.stdout,
                &mut *stdio.stderr,
            )
            .with_exit_timeout(token);
            session.execute(
                &working_dir.to_string_lossy(),
                main_class,
                args,
                &environment,
            )
        };
        self.set_current(None);

        match result {
            Ok(code) => {
                debug!("nailgun run of {main_class} at {address} exited with {code}");
                Ok(code)
            }
            Err(StreamError::Cancelled(reason)) => Err(NailgunError::Cancelled { address, reason }),
            Err(source) => Err(NailgunError::Execution { address, source }),
        }
    }

    pub fn set_exit_timeout(&self, timeout: Duration, reason: &str) {
        set_exit_timeout_in(&self.current, timeout, reason);
    }

    pub fn maybe_send_signal(&self, signal: Signal) {
        send_signal_to(self.remote_pid, signal);
    }

    fn set_current(&self, token: Option<ExitTimeoutToken>) {
        let mut slot = self.current.lock().unwrap_or_else(|p| p.into_inner());
        *slot = token;
    }
}

impl std::fmt::Debug for NailgunClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NailgunClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("remote_pid", &self.remote_pid)
            .finish()
    }
}
