//! Filesystem helpers: sidecar path derivation and atomic rename-based writes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Derive the WAL sidecar path for a primary data file.
#[must_use]
pub fn wal_path(data_path: &Path) -> PathBuf {
    sidecar(data_path, "wal")
}

/// Derive the inter-process lock sidecar path.
#[must_use]
pub fn lock_path(data_path: &Path) -> PathBuf {
    sidecar(data_path, "lock")
}

/// Derive the index catalog sidecar path. `msgpack` selects the alternate
/// extension used when MessagePack encoding is enabled.
#[must_use]
pub fn catalog_path(data_path: &Path, msgpack: bool) -> PathBuf {
    if msgpack { sidecar(data_path, "idx.msgpack") } else { sidecar(data_path, "idx.json") }
}

/// Derive the transient compaction backup sidecar path.
#[must_use]
pub fn backup_path(data_path: &Path) -> PathBuf {
    sidecar(data_path, "backup")
}

fn sidecar(data_path: &Path, suffix: &str) -> PathBuf {
    let mut s = data_path.as_os_str().to_os_string();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

/// Create a file with restrictive permissions where supported.
///
/// # Errors
/// Returns an error if the file cannot be created/opened.
pub fn create_secure(path: &Path) -> io::Result<File> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        OpenOptions::new().write(true).create(true).truncate(false).mode(0o600).open(path)
    }
    #[cfg(not(unix))]
    {
        OpenOptions::new().write(true).create(true).truncate(false).open(path)
    }
}

/// Open a file for read/write, creating it if missing, without truncation.
///
/// # Errors
/// Returns an error if the file cannot be opened.
pub fn open_rw_no_trunc(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)
}

/// Atomically replace `path` with the contents of `tmp_path` via rename.
/// Used by WAL compaction and index-catalog rewrites (both are
/// "rewritten atomically via rename").
///
/// # Errors
/// Returns an error if the rename fails.
pub fn atomic_replace(tmp_path: &Path, path: &Path) -> io::Result<()> {
    std::fs::rename(tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_paths_append_suffix() {
        let base = PathBuf::from("/tmp/my.bmdb");
        assert_eq!(wal_path(&base), PathBuf::from("/tmp/my.bmdb.wal"));
        assert_eq!(lock_path(&base), PathBuf::from("/tmp/my.bmdb.lock"));
        assert_eq!(catalog_path(&base, false), PathBuf::from("/tmp/my.bmdb.idx.json"));
        assert_eq!(catalog_path(&base, true), PathBuf::from("/tmp/my.bmdb.idx.msgpack"));
        assert_eq!(backup_path(&base), PathBuf::from("/tmp/my.bmdb.backup"));
    }
}
