//! Single-instance lock
//!
//! The crawler is multi-threaded and updates the shared tracker, so no
//! two instances targeting the same tracker may run at once. Mutual
//! exclusion is filesystem-local: an exclusive, non-blocking OS-level
//! lock on `phenodcc.lock` in the current directory. An unclean exit
//! leaves the file behind but the OS releases the lock, so the next run
//! re-acquires cleanly.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

/// Well-known lock path, relative to the working directory.
pub const LOCK_PATH: &str = "phenodcc.lock";

#[derive(Debug, Error)]
pub enum LockError {
    /// The lock path exists but is not a regular file; an operator must
    /// verify and delete it.
    #[error("Corrupt lock path '{0}': must be a regular file")]
    InvalidLock(PathBuf),

    /// Another crawler instance holds the lock.
    #[error("Another crawler instance holds the lock '{0}'")]
    AlreadyRunning(PathBuf),

    #[error("Failed to acquire lock '{path}': {source}")]
    Acquire {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Guard holding the instance lock for the process lifetime. Releasing
/// (or dropping) unlocks and deletes the lock file.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock at the well-known path.
    pub fn acquire() -> Result<Self, LockError> {
        Self::acquire_at(Path::new(LOCK_PATH))
    }

    /// Acquire the lock at an explicit path.
    pub fn acquire_at(path: &Path) -> Result<Self, LockError> {
        if path.exists() && !path.is_file() {
            return Err(LockError::InvalidLock(path.to_path_buf()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Acquire {
                path: path.to_path_buf(),
                source,
            })?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired instance lock");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(LockError::AlreadyRunning(path.to_path_buf()))
            }
            Err(source) => Err(LockError::Acquire {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and delete the lock file.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
        debug!(path = %self.path.display(), "Released instance lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_PATH);

        let lock = InstanceLock::acquire_at(&path).unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());

        // Re-acquirable after a clean release.
        let _again = InstanceLock::acquire_at(&path).unwrap();
    }

    #[test]
    fn second_instance_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_PATH);

        let _held = InstanceLock::acquire_at(&path).unwrap();
        match InstanceLock::acquire_at(&path) {
            Err(LockError::AlreadyRunning(p)) => assert_eq!(p, path),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn directory_at_lock_path_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LOCK_PATH);
        fs::create_dir(&path).unwrap();

        match InstanceLock::acquire_at(&path) {
            Err(LockError::InvalidLock(p)) => assert_eq!(p, path),
            other => panic!("expected InvalidLock, got {other:?}"),
        }
    }
}
