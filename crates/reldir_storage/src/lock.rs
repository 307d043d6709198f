//! Advisory file lock guarding a database file.
//!
//! The lock lives in a sidecar `<file>.lock` so that compaction, which
//! renames a fresh image over the database file, never drops it.

use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Held lock on a database file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

impl FileLock {
    /// Acquires the lock, exclusive for writers and shared for readers,
    /// retrying until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if another process keeps the lock past the deadline.
    pub fn acquire(db_path: &Path, shared: bool, timeout: Duration) -> StorageResult<Self> {
        let path = lock_path(db_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let deadline = Instant::now() + timeout;
        loop {
            let attempt = if shared {
                FileExt::try_lock_shared(&file)
            } else {
                FileExt::try_lock_exclusive(&file)
            };
            if attempt.is_ok() {
                debug!(path = %path.display(), shared, "acquired database lock");
                return Ok(Self { path, file });
            }
            if Instant::now() >= deadline {
                return Err(StorageError::Timeout);
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    db_path.with_file_name(name)
}
