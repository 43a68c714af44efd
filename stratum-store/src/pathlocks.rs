//! Per-path file locks.
//!
//! Ingestion and import of a destination path are serialised across
//! processes by an exclusive `flock()` on `<path>.lock`. The database
//! engine serialises metadata; these locks serialise the filesystem work
//! that happens outside any transaction.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

/// An exclusive lock on a store path, released on drop.
pub struct PathLock {
    _flock: Flock<File>,
    _lock_path: PathBuf,
}

impl PathLock {
    /// Acquire the lock for `path`, blocking until it is free. The lock
    /// file is created next to the path if it does not exist.
    pub fn lock(path: &Path) -> io::Result<Self> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::other(format!("flock failed: {errno}")))?;

        Ok(Self {
            _flock: flock,
            _lock_path: lock_path,
        })
    }
}
