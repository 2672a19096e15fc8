/*!
Host process access used by the resolver and the executor.

- `ProcessTable`: a point-in-time view of running processes and their listening TCP ports.
  `ProcTable` reads a procfs tree (`/proc` by default). Without one (macOS, BSDs) processes
  come from `sysinfo` and listening ports from `lsof -iTCP -sTCP:LISTEN`; when `lsof` is not
  installed no ports are found and every server looks unreachable.
- `ProcessControl`: liveness probe (signal 0) and hard kill (SIGKILL) by pid.
*/
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, warn};

/// TCP state code for LISTEN in /proc/net/tcp{,6}.
const TCP_LISTEN: &str = "0A";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
}

pub trait ProcessTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessSnapshot>>;

    /// TCP ports `pid` is listening on, lowest first.
    fn listening_ports(&self, pid: u32) -> io::Result<Vec<u16>>;
}

pub trait ProcessControl {
    fn is_alive(&self, pid: u32) -> bool;

    /// Hard-kill `pid`; a process that is already gone is not an error.
    fn kill(&self, pid: u32) -> io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ProcTable {
    root: PathBuf,
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcTable {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_process(&self, pid: u32) -> Option<ProcessSnapshot> {
        let dir = self.root.join(pid.to_string());
        let raw = fs::read(dir.join("cmdline")).ok()?;
        let cmdline: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        let name = fs::read_to_string(dir.join("comm"))
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default();
        Some(ProcessSnapshot { pid, name, cmdline })
    }

    fn socket_inodes(&self, pid: u32) -> io::Result<BTreeSet<u64>> {
        let mut inodes = BTreeSet::new();
        for fd in fs::read_dir(self.root.join(pid.to_string()).join("fd"))?.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|rest| rest.strip_suffix(']'))
                .and_then(|n| n.parse::<u64>().ok())
            {
                inodes.insert(inode);
            }
        }
        Ok(inodes)
    }
}

impl ProcessTable for ProcTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessSnapshot>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no procfs at {}; listing processes via sysinfo", self.root.display());
                return Ok(sysinfo_snapshot());
            }
            Err(e) => return Err(e),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes may exit mid-scan.
            if let Some(p) = self.read_process(pid) {
                out.push(p);
            }
        }
        out.sort_by_key(|p| p.pid);
        Ok(out)
    }

    fn listening_ports(&self, pid: u32) -> io::Result<Vec<u16>> {
        if !self.root.is_dir() {
            return lsof_listening_ports(pid);
        }
        let inodes = self.socket_inodes(pid)?;
        if inodes.is_empty() {
            return Ok(Vec::new());
        }
        let mut ports = BTreeSet::new();
        for table in ["tcp", "tcp6"] {
            let Ok(text) = fs::read_to_string(self.root.join("net").join(table)) else {
                continue;
            };
            ports.extend(listening_ports_in(&text, &inodes));
        }
        Ok(ports.into_iter().collect())
    }
}

/// Ports of LISTEN rows in a /proc/net/tcp{,6} table whose socket inode is in `inodes`.
fn listening_ports_in(table: &str, inodes: &BTreeSet<u64>) -> Vec<u16> {
    let mut out = Vec::new();
    for line in table.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 10 || cols[3] != TCP_LISTEN {
            continue;
        }
        let Ok(inode) = cols[9].parse::<u64>() else {
            continue;
        };
        if !inodes.contains(&inode) {
            continue;
        }
        if let Some(port) = cols[1]
            .rsplit_once(':')
            .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok())
        {
            out.push(port);
        }
    }
    out
}

fn sysinfo_snapshot() -> Vec<ProcessSnapshot> {
    let refresh = ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, refresh);
    let mut out: Vec<ProcessSnapshot> = system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessSnapshot {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
            cmdline: process
                .cmd()
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect(),
        })
        .collect();
    out.sort_by_key(|p| p.pid);
    out
}

fn lsof_listening_ports(pid: u32) -> io::Result<Vec<u16>> {
    let pid_arg = pid.to_string();
    let output = match Command::new("lsof")
        .args(["-nP", "-a", "-p", &pid_arg, "-iTCP", "-sTCP:LISTEN", "-Fn"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) => output,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("lsof not found; cannot discover listening ports of pid {pid}");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    // lsof exits 1 when the pid has no matching sockets.
    Ok(parse_lsof_ports(&String::from_utf8_lossy(&output.stdout)))
}

/// Ports from `lsof -Fn` name records such as `n*:50123` or `n[::1]:50123`.
fn parse_lsof_ports(text: &str) -> Vec<u16> {
    let ports: BTreeSet<u16> = text
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .filter_map(|name| name.rsplit_once(':'))
        .filter_map(|(_, port)| port.parse().ok())
        .collect();
    ports.into_iter().collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalControl;

fn to_pid(pid: u32) -> io::Result<Pid> {
    i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("pid out of range: {pid}"),
            )
        })
}

impl ProcessControl for SignalControl {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(p) = to_pid(pid) else {
            return false;
        };
        match kill(p, None) {
            Ok(()) => true,
            // Exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        match kill(to_pid(pid)?, Signal::SIGKILL) {
            Ok(()) => {
                info!("killed nailgun server pid {pid}");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!("nailgun server pid {pid} already exited");
                Ok(())
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }
}
