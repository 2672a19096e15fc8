/*!
Server lifecycle: find a warm Nailgun server for this workspace, reuse it when its
fingerprint matches the requested JVM, otherwise replace it, and hand back a client.

Per call to `get_client` (serialized across processes by the workdir spawn lock):
1) resolve the server owned by the workdir;
2) decide with `plan_reuse` (liveness probe + fingerprint and executable comparison);
3) on a stale server, hard-kill it; then spawn, wait for its port line and probe the port;
4) re-resolve and require the new server to identify with the expected fingerprint.
*/
pub mod endpoint;
pub mod fingerprint;
pub mod launcher;
pub mod process;
pub mod resolver;

use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::client::{NailgunClient, NailgunStdio};
use crate::config::ExecutorConfig;
use crate::errors::NailgunError;
use crate::lock::{should_acquire_lock, SpawnLock};
pub use endpoint::Endpoint;
pub use fingerprint::fingerprint_data;
pub use launcher::{
    await_port, parse_port_line, startup_log, DetachedLauncher, LaunchSpec, Launcher,
    STDERR_LOG, STDOUT_LOG,
};
pub use process::{ProcTable, ProcessControl, ProcessSnapshot, ProcessTable, SignalControl};
pub use resolver::{
    buildroot_tag, buildroot_tag_prefix, fingerprint_tag, owner_tag, parse_fingerprint,
    EndpointResolver, JVM_PROCESS_NAME, NAILGUN_NS,
};

/// What to do with the server currently registered for the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Alive and built for the requested JVM.
    Reuse(Endpoint),
    /// Nothing usable is running.
    Spawn,
    /// Alive but built for a different JVM; kill it, then spawn.
    Replace(Endpoint),
}

pub fn plan_reuse(
    resolved: Option<Endpoint>,
    is_alive: impl Fn(u32) -> bool,
    fingerprint: &str,
    exe: &str,
) -> Decision {
    match resolved {
        None => Decision::Spawn,
        Some(ep) if !is_alive(ep.pid) => {
            debug!("nailgun server pid {} is gone", ep.pid);
            Decision::Spawn
        }
        Some(ep) if ep.fingerprint == fingerprint && ep.exe == exe => Decision::Reuse(ep),
        Some(ep) => Decision::Replace(ep),
    }
}

/// JVM a server is requested for. Together with the java executable this determines the
/// server's fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerRequest {
    pub jvm_options: Vec<String>,
    pub classpath: Vec<String>,
    pub jvm_version: String,
}

impl ServerRequest {
    pub fn fingerprint(&self) -> String {
        fingerprint_data(&self.jvm_options, &self.classpath, &self.jvm_version)
    }
}

pub struct NailgunExecutor<T = ProcTable, C = SignalControl, L = DetachedLauncher> {
    buildroot: PathBuf,
    workdir: PathBuf,
    config: ExecutorConfig,
    resolver: EndpointResolver<T>,
    control: C,
    launcher: L,
}

impl NailgunExecutor {
    pub fn new(
        buildroot: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        config: ExecutorConfig,
    ) -> Self {
        Self::with_parts(
            buildroot,
            workdir,
            config,
            ProcTable::default(),
            SignalControl,
            DetachedLauncher,
        )
    }
}

impl<T: ProcessTable, C: ProcessControl, L: Launcher> NailgunExecutor<T, C, L> {
    pub fn with_parts(
        buildroot: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        config: ExecutorConfig,
        table: T,
        control: C,
        launcher: L,
    ) -> Self {
        let buildroot = buildroot.into();
        Self {
            resolver: EndpointResolver::new(table, &buildroot),
            buildroot,
            workdir: workdir.into(),
            config,
            control,
            launcher,
        }
    }

    pub fn buildroot(&self) -> &Path {
        &self.buildroot
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn resolver(&self) -> &EndpointResolver<T> {
        &self.resolver
    }

    fn java_exe(&self) -> String {
        self.config.java.display().to_string()
    }

    /// The workspace's usable server, if any.
    pub fn find(&self) -> Result<Option<Endpoint>, NailgunError> {
        self.resolver
            .find(&self.workdir)
            .map_err(NailgunError::ProcessTable)
    }

    fn lock(&self) -> Result<Option<SpawnLock>, NailgunError> {
        if !should_acquire_lock() {
            return Ok(None);
        }
        let lock = match SpawnLock::try_acquire(&self.workdir) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                info!("{e}; waiting for it");
                SpawnLock::acquire(&self.workdir)
            }
            other => other,
        };
        lock.map(Some).map_err(|source| NailgunError::Lock {
            path: self.workdir.join(crate::lock::SPAWN_LOCK_FILE).display().to_string(),
            source,
        })
    }

    /// A client connected to a server built for `request`, spawning one when needed.
    pub fn get_client(
        &self,
        request: &ServerRequest,
        stdio: NailgunStdio,
    ) -> Result<NailgunClient, NailgunError> {
        let _lock = self.lock()?;
        let fingerprint = request.fingerprint();
        let exe = self.java_exe();

        let resolved = self.find()?;
        let decision = plan_reuse(
            resolved,
            |pid| self.control.is_alive(pid),
            &fingerprint,
            &exe,
        );
        let endpoint = match decision {
            Decision::Reuse(ep) => {
                debug!("reusing nailgun server {ep}");
                ep
            }
            Decision::Replace(old) => {
                info!(
                    "nailgun server pid {} has fingerprint {}, want {}; replacing it",
                    old.pid, old.fingerprint, fingerprint
                );
                self.kill_pid(old.pid);
                self.spawn(request, &fingerprint)?
            }
            Decision::Spawn => self.spawn(request, &fingerprint)?,
        };

        Ok(NailgunClient::new(self.config.host.clone(), endpoint.port, stdio)
            .with_remote_pid(Some(endpoint.pid))
            .with_connect_timeout(self.config.connect_timeout))
    }

    fn spawn(&self, request: &ServerRequest, fingerprint: &str) -> Result<Endpoint, NailgunError> {
        let spec = LaunchSpec {
            java: self.config.java.clone(),
            jvm_options: request.jvm_options.clone(),
            tags: vec![
                buildroot_tag(&self.buildroot),
                owner_tag(&self.workdir),
                fingerprint_tag(fingerprint),
            ],
            classpath: request.classpath.clone(),
            server_main: self.config.server_main.clone(),
            workdir: self.workdir.clone(),
            startup_timeout: self.config.startup_timeout,
            debug_startup_timeout: self.config.debug_startup_timeout,
        };
        let port = self.launcher.launch(&spec)?;
        self.ensure_connectable(port)?;

        // Another (possibly dying) server may still be registered for the workdir; only the
        // one listening on the announced port counts.
        let owned = self
            .resolver
            .find_owned(&self.workdir)
            .map_err(NailgunError::ProcessTable)?;
        let spawned = owned
            .iter()
            .filter_map(|p| self.resolver.endpoint_of(p))
            .find(|ep| ep.port == port);
        match spawned {
            Some(ep) if ep.fingerprint == fingerprint => Ok(ep),
            Some(ep) => Err(self.startup_error(format!(
                "server on port {port} identifies as {ep}, expected fingerprint {fingerprint}"
            ))),
            None => Err(self.startup_error(format!(
                "server on port {port} is not discoverable as owned by {}",
                self.workdir.display()
            ))),
        }
    }

    fn startup_error(&self, message: String) -> NailgunError {
        NailgunError::Startup {
            message,
            log: startup_log(&self.workdir),
        }
    }

    /// Connect-and-close probes until one succeeds or the attempt budget is spent.
    pub fn ensure_connectable(&self, port: u16) -> Result<(), NailgunError> {
        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to probe");
        for attempt in 1..=self.config.connect_attempts {
            match probe(&self.config.host, port, self.config.connect_timeout) {
                Ok(()) => {
                    debug!("nailgun server port {port} accepted probe {attempt}");
                    return Ok(());
                }
                Err(e) => {
                    debug!("probe {attempt} of port {port} failed: {e}");
                    last_err = e;
                }
            }
            std::thread::sleep(self.config.connect_retry_sleep);
        }
        Err(self.startup_error(format!(
            "could not connect to {}:{port} after {} attempts: {last_err}",
            self.config.host, self.config.connect_attempts
        )))
    }

    fn kill_pid(&self, pid: u32) -> bool {
        match self.control.kill(pid) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to kill nailgun server pid {pid}: {e}");
                false
            }
        }
    }

    /// Kill this workspace's servers. Returns the pids signalled.
    pub fn kill(&self) -> Result<Vec<u32>, NailgunError> {
        let owned = self
            .resolver
            .find_owned(&self.workdir)
            .map_err(NailgunError::ProcessTable)?;
        Ok(owned
            .into_iter()
            .filter(|p| self.kill_pid(p.pid))
            .map(|p| p.pid)
            .collect())
    }

    /// Kill every server under this buildroot or, with `everywhere`, under any buildroot.
    pub fn killall(&self, everywhere: bool) -> Result<Vec<u32>, NailgunError> {
        let servers = self
            .resolver
            .find_all(everywhere)
            .map_err(NailgunError::ProcessTable)?;
        Ok(servers
            .into_iter()
            .filter(|p| self.kill_pid(p.pid))
            .map(|p| p.pid)
            .collect())
    }
}

fn probe(host: &str, port: u16, timeout: std::time::Duration) -> io::Result<()> {
    let mut last_err = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        "host resolved to no addresses",
    );
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(sock) => {
                drop(sock);
                return Ok(());
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}
