use fs2::FileExt;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

pub const SPAWN_LOCK_FILE: &str = "nailgun.lock";

/// Exclusive advisory lock serializing server resolve/spawn for one workdir across
/// processes. Released on drop; the lock file itself is left in place so waiters never
/// end up holding locks on different inodes.
#[derive(Debug)]
pub struct SpawnLock {
    file: File,
    path: PathBuf,
}

impl Drop for SpawnLock {
    fn drop(&mut self) {
        // Best-effort unlock; closing the file releases it anyway
        let _ = self.file.unlock();
        debug!("released spawn lock {}", self.path.display());
    }
}

impl SpawnLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock at `<workdir>/nailgun.lock` is held.
    pub fn acquire(workdir: &Path) -> io::Result<SpawnLock> {
        let path = workdir.join(SPAWN_LOCK_FILE);
        let file = open_lock_file(&path)?;
        file.lock_exclusive()?;
        debug!("acquired spawn lock {}", path.display());
        Ok(SpawnLock { file, path })
    }

    /// Take the lock only if nobody else holds it.
    pub fn try_acquire(workdir: &Path) -> io::Result<SpawnLock> {
        let path = workdir.join(SPAWN_LOCK_FILE);
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(SpawnLock { file, path }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "another process is starting a nailgun server (lock held: {})",
                    path.display()
                ),
            )),
            Err(e) => Err(e),
        }
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
}

/// Return true if the executor should serialize spawns through the lock file.
/// Honor NAILGUN_RUNNER_SKIP_LOCK=1 to skip it (single-process tools, read-only workdirs).
pub fn should_acquire_lock() -> bool {
    env::var("NAILGUN_RUNNER_SKIP_LOCK").ok().as_deref() != Some("1")
}
