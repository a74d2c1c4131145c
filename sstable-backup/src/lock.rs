//! Process-wide advisory lock serializing backups and restores on a node.

use crate::{BackupError, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exclusive `flock` held until dropped.
#[derive(Debug)]
pub struct GlobalLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl GlobalLock {
    /// Take the lock without waiting; fails when another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            BackupError::Lock(format!(
                "unable to lock {}, another backup or restore is running: {}",
                path.display(),
                errno
            ))
        })?;
        info!(lock_file = %path.display(), "Acquired global lock");
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GlobalLock {
    fn drop(&mut self) {
        debug!(lock_file = %self.path.display(), "Releasing global lock");
    }
}
