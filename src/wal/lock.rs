//! Inter-process exclusive lock file with retry/back-off.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::errors::{Error, Result};

const MAX_ATTEMPTS: u32 = 10;

/// Holds an exclusively-created lock file for the engine's lifetime; the
/// lock is released on `drop` (or explicit [`release`](Self::release)).
pub struct FileLock {
    path: PathBuf,
    held: bool,
}

impl FileLock {
    /// # Errors
    /// Returns `Error::LockContention` if the lock file still exists after
    /// `MAX_ATTEMPTS` short back-off retries, or an I/O error for anything
    /// else unexpected.
    pub fn acquire(path: &Path) -> Result<Self> {
        for attempt in 0..MAX_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => return Ok(Self { path: path.to_path_buf(), held: true }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    thread::sleep(Duration::from_millis(u64::from(attempt + 1)));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::LockContention { path: path.to_path_buf() })
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.held {
            return;
        }
        if std::fs::remove_file(&self.path).is_err() {
            let mut stale = self.path.clone().into_os_string();
            stale.push(".stale");
            let _ = std::fs::File::create(PathBuf::from(stale));
        }
        self.held = false;
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_drop_allows_reacquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.lock");
        {
            let _lock = FileLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        let _lock2 = FileLock::acquire(&path).unwrap();
    }

    #[test]
    fn concurrent_acquire_is_contention() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.lock");
        let _first = FileLock::acquire(&path).unwrap();
        let err = FileLock::acquire(&path).unwrap_err();
        assert!(matches!(err, Error::LockContention { .. }));
    }
}
