/*!
Finds warm Nailgun servers by the tags they carry on their own command line.

A server spawned for workspace `W` with buildroot `R` carries:
- `-Dnailgun.buildroot=R`
- `-Dnailgun.owner=W`
- `-Dnailgun.fingerprint=<hex>`

Only processes named `java` are considered.
*/
use std::io;
use std::path::Path;

use tracing::debug;

use super::endpoint::Endpoint;
use super::process::{ProcessSnapshot, ProcessTable};

pub const NAILGUN_NS: &str = "nailgun";
pub const JVM_PROCESS_NAME: &str = "java";

fn tag(key: &str, value: &str) -> String {
    format!("-D{NAILGUN_NS}.{key}={value}")
}

pub fn buildroot_tag(buildroot: &Path) -> String {
    tag("buildroot", &buildroot.display().to_string())
}

pub fn owner_tag(workdir: &Path) -> String {
    tag("owner", &workdir.display().to_string())
}

pub fn fingerprint_tag(fingerprint: &str) -> String {
    tag("fingerprint", fingerprint)
}

/// Prefix shared by every buildroot tag, whatever the buildroot.
pub fn buildroot_tag_prefix() -> String {
    format!("-D{NAILGUN_NS}.buildroot")
}

fn fingerprint_tag_prefix() -> String {
    format!("-D{NAILGUN_NS}.fingerprint=")
}

/// Fingerprint recorded on a server's command line, if any.
pub fn parse_fingerprint(cmdline: &[String]) -> Option<String> {
    let prefix = fingerprint_tag_prefix();
    cmdline
        .iter()
        .find_map(|arg| arg.strip_prefix(prefix.as_str()))
        .filter(|fp| !fp.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct EndpointResolver<T> {
    table: T,
    buildroot: String,
}

impl<T: ProcessTable> EndpointResolver<T> {
    pub fn new(table: T, buildroot: &Path) -> Self {
        Self {
            table,
            buildroot: buildroot_tag(buildroot),
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    fn is_jvm(p: &ProcessSnapshot) -> bool {
        p.name == JVM_PROCESS_NAME
    }

    /// Servers owned by `workdir` under this buildroot, whether or not they are usable.
    pub fn find_owned(&self, workdir: &Path) -> io::Result<Vec<ProcessSnapshot>> {
        let owner = owner_tag(workdir);
        Ok(self
            .table
            .snapshot()?
            .into_iter()
            .filter(|p| {
                Self::is_jvm(p)
                    && p.cmdline.iter().any(|a| *a == self.buildroot)
                    && p.cmdline.iter().any(|a| *a == owner)
            })
            .collect())
    }

    /// The usable server owned by `workdir`, or None when there is none.
    pub fn find(&self, workdir: &Path) -> io::Result<Option<Endpoint>> {
        for p in self.find_owned(workdir)? {
            if let Some(endpoint) = self.endpoint_of(&p) {
                debug!("resolved nailgun server {endpoint}");
                return Ok(Some(endpoint));
            }
        }
        Ok(None)
    }

    /// Every server under this buildroot or, with `everywhere`, under any buildroot.
    pub fn find_all(&self, everywhere: bool) -> io::Result<Vec<ProcessSnapshot>> {
        let prefix = buildroot_tag_prefix();
        Ok(self
            .table
            .snapshot()?
            .into_iter()
            .filter(|p| {
                Self::is_jvm(p)
                    && p.cmdline.iter().any(|a| {
                        if everywhere {
                            a.starts_with(prefix.as_str())
                        } else {
                            *a == self.buildroot
                        }
                    })
            })
            .collect())
    }

    /// Endpoint of a tagged server; None when its fingerprint or listening port is missing.
    pub fn endpoint_of(&self, p: &ProcessSnapshot) -> Option<Endpoint> {
        let exe = p.cmdline.first()?;
        let Some(fingerprint) = parse_fingerprint(&p.cmdline) else {
            debug!("nailgun server pid {} carries no fingerprint", p.pid);
            return None;
        };
        let port = match self.table.listening_ports(p.pid) {
            Ok(ports) => ports.into_iter().next(),
            Err(e) => {
                debug!("failed to list sockets of pid {}: {e}", p.pid);
                None
            }
        };
        let Some(port) = port else {
            debug!("nailgun server pid {} is not listening", p.pid);
            return None;
        };
        Some(Endpoint::new(exe.clone(), fingerprint, p.pid, port))
    }
}
