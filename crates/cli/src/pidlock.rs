//! Single-instance guarantee.
//!
//! The daemon holds an exclusive, non-blocking advisory lock on the PID
//! file for its whole lifetime. The file contains the decimal PID followed
//! by a newline and stays world-readable so control tools can inspect it.

use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PidLockError {
    /// Another instance is alive and holds the lock.
    #[error("another instance already holds the lock on {0}")]
    Contended(PathBuf),

    #[error("cannot set up PID file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct PidLock {
    lock: Flock<File>,
    path: PathBuf,
}

impl PidLock {
    /// Acquire the lock, refusing to block and refusing to follow
    /// symlinks. The file is only truncated once the lock is ours.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PidLockError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .custom_flags(libc::O_NOFOLLOW)
            .mode(0o644)
            .open(&path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, _errno)) => return Err(PidLockError::Contended(path)),
        };

        lock.set_len(0)?;
        writeln!(lock, "{}", std::process::id())?;
        lock.flush()?;

        debug!(path = %path.display(), "PID lock acquired");
        Ok(Self { lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // remove while still holding the lock so a racing starter never
        // sees an unlocked stale file
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to remove PID file");
            }
        }
    }
}
