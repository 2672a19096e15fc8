/*!
Spawning a detached Nailgun server and waiting until it reports its port.

The server runs in its own session (`setsid`) with stdin closed and stdout/stderr going to
`nailgun.stdout` / `nailgun.stderr` in the workdir. Readiness is read from the stdout log:
the server prints a line ending in `port <N>.` once it is listening. A JDWP
"Listening for transport dt_socket" line means the JVM is paused for a debugger, and the
readiness deadline is extended accordingly.
*/
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::errors::NailgunError;
use crate::util::{read_lossy, shell_join};

pub const STDOUT_LOG: &str = "nailgun.stdout";
pub const STDERR_LOG: &str = "nailgun.stderr";
/// Bind spec telling the server to listen on a free port picked by the OS.
pub const WILDCARD_BIND: &str = ":0";
const DEBUGGER_LINE_PREFIX: &str = "Listening for transport dt_socket at address:";
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(50);

static PORT_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r".*\s+port\s+(\d+)\.$").expect("valid port line pattern"));

/// Everything needed to start one server.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub java: PathBuf,
    pub jvm_options: Vec<String>,
    /// Self-identification tags (buildroot, owner, fingerprint).
    pub tags: Vec<String>,
    pub classpath: Vec<String>,
    pub server_main: String,
    pub workdir: PathBuf,
    pub startup_timeout: Duration,
    pub debug_startup_timeout: Duration,
}

impl LaunchSpec {
    pub fn command_line(&self) -> Vec<String> {
        let mut cmd = vec![self.java.display().to_string()];
        cmd.extend(self.jvm_options.iter().cloned());
        cmd.extend(self.tags.iter().cloned());
        cmd.push("-cp".to_string());
        cmd.push(self.classpath.join(":"));
        cmd.push(self.server_main.clone());
        cmd.push(WILDCARD_BIND.to_string());
        cmd
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.workdir.join(STDOUT_LOG)
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.workdir.join(STDERR_LOG)
    }
}

/// Starts a server and returns the port it is listening on.
pub trait Launcher {
    fn launch(&self, spec: &LaunchSpec) -> Result<u16, NailgunError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedLauncher;

fn truncate(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

impl Launcher for DetachedLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<u16, NailgunError> {
        let argv = spec.command_line();
        let command = shell_join(&argv);
        let spawn_err = |source: io::Error| NailgunError::Spawn {
            command: command.clone(),
            source,
        };

        fs::create_dir_all(&spec.workdir).map_err(spawn_err)?;
        let out = truncate(&spec.stdout_log()).map_err(spawn_err)?;
        let err = truncate(&spec.stderr_log()).map_err(spawn_err)?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(&spec.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));
        // Detach from our session so the server outlives this process and its terminal.
        unsafe {
            cmd.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(io::Error::from));
        }

        info!("spawning nailgun server: {command}");
        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();

        let exited = Arc::new(AtomicBool::new(false));
        let exited_cl = exited.clone();
        let reaper = std::thread::Builder::new()
            .name(format!("nailgun-reaper-{pid}"))
            .spawn(move || {
                match child.wait() {
                    Ok(status) => debug!("nailgun server pid {pid} exited: {status}"),
                    Err(e) => warn!("failed to wait for nailgun server pid {pid}: {e}"),
                }
                exited_cl.store(true, Ordering::SeqCst);
            });
        if let Err(e) = reaper {
            warn!("failed to start reaper for nailgun server pid {pid}: {e}");
        }

        let port = await_port(
            &spec.stdout_log(),
            spec.startup_timeout,
            spec.debug_startup_timeout,
            &exited,
        )
        .map_err(|message| NailgunError::Startup {
            message,
            log: startup_log(&spec.workdir),
        })?;
        info!("nailgun server pid {pid} listening on port {port}");
        Ok(port)
    }
}

/// Port announced by a server stdout line, if this is the announcement.
pub fn parse_port_line(line: &str) -> Option<u16> {
    PORT_LINE_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Tail `log` until the server announces its port.
///
/// Fails with a description when `startup_timeout` passes first, or when `exited` is set
/// before the announcement. Seeing the debugger line moves the deadline to
/// `debug_timeout` after launch.
pub fn await_port(
    log: &Path,
    startup_timeout: Duration,
    debug_timeout: Duration,
    exited: &AtomicBool,
) -> Result<u16, String> {
    let started = Instant::now();
    let mut deadline = started + startup_timeout;
    let mut reader: Option<BufReader<File>> = None;
    let mut pending = String::new();

    loop {
        if reader.is_none() {
            reader = File::open(log).ok().map(BufReader::new);
        }
        let mut progressed = false;
        if let Some(r) = reader.as_mut() {
            match r.read_line(&mut pending) {
                Ok(0) => {}
                Ok(_) if pending.ends_with('\n') => {
                    progressed = true;
                    let line = pending.trim_end_matches(['\r', '\n']);
                    if let Some(port) = parse_port_line(line) {
                        return Ok(port);
                    }
                    if line.starts_with(DEBUGGER_LINE_PREFIX) {
                        info!(
                            "nailgun server is waiting for a debugger; \
                             waiting up to {debug_timeout:?}"
                        );
                        deadline = started + debug_timeout;
                    }
                    pending.clear();
                }
                Ok(_) => {}
                Err(e) => return Err(format!("failed to read {}: {e}", log.display())),
            }
        }
        if progressed {
            continue;
        }
        if exited.load(Ordering::SeqCst) {
            return Err("server exited before reporting a port".to_string());
        }
        if Instant::now() >= deadline {
            return Err(format!(
                "timed out after {:?} waiting for a port line in {}",
                deadline - started,
                log.display()
            ));
        }
        std::thread::sleep(LOG_POLL_INTERVAL);
    }
}

/// Contents of both startup logs, for error context.
pub fn startup_log(workdir: &Path) -> String {
    let mut out = String::new();
    for name in [STDOUT_LOG, STDERR_LOG] {
        let path = workdir.join(name);
        out.push_str(&format!("--- {} ---\n", path.display()));
        out.push_str(&read_lossy(&path));
        if !out.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
