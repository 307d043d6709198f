//! Error types for the key-value engine.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed error raised by caller code inside a transaction closure.
pub type CallerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur in the key-value engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A bucket along the requested path does not exist.
    #[error("bucket not found: {path}")]
    PathNotFound {
        /// The bucket path, joined with `/`.
        path: String,
    },

    /// The requested key does not exist in the bucket.
    #[error("key not found")]
    KeyNotFound,

    /// A bucket with this name already exists.
    #[error("bucket already exists: {path}")]
    BucketExists {
        /// The bucket path, joined with `/`.
        path: String,
    },

    /// The bucket path is empty or contains an empty segment.
    #[error("invalid bucket path: {0}")]
    InvalidPath(String),

    /// A write was attempted on a read-only database.
    #[error("database is read-only")]
    ReadOnly,

    /// The database file is corrupted.
    #[error("database corrupted: {0}")]
    Corrupted(String),

    /// The file is not a database file.
    #[error("invalid database format: {0}")]
    InvalidFormat(String),

    /// The file was written by a newer format version.
    #[error("incompatible format version: found {found}, supported {supported}")]
    IncompatibleVersion {
        /// The version found in the header.
        found: u16,
        /// The newest version this build reads.
        supported: u16,
    },

    /// The file lock could not be acquired within the configured timeout.
    #[error("timed out waiting for database lock")]
    Timeout,

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A commit record could not be encoded or decoded.
    #[error("record encoding error: {0}")]
    Encoding(String),

    /// Another closure in the same batch failed the shared commit.
    #[error("batch commit failed: {0}")]
    BatchFailed(String),

    /// The transaction closure returned its own error.
    #[error("transaction aborted: {0}")]
    Aborted(CallerError),
}

impl StorageError {
    /// Creates a path-not-found error for a bucket path.
    pub fn path_not_found(path: &[&str]) -> Self {
        Self::PathNotFound {
            path: path.join("/"),
        }
    }

    /// Creates a bucket-exists error for a bucket path.
    pub fn bucket_exists(path: &[&str]) -> Self {
        Self::BucketExists {
            path: path.join("/"),
        }
    }

    /// Wraps a caller error so it can abort a transaction closure.
    pub fn aborted<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Aborted(Box::new(err))
    }

    /// Returns true when the error means "nothing stored there".
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound | Self::PathNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_errors_join_segments() {
        let err = StorageError::path_not_found(&["_manifest", "default"]);
        assert_eq!(err.to_string(), "bucket not found: _manifest/default");
        assert!(err.is_not_found());
    }

    #[test]
    fn aborted_keeps_source() {
        let inner = io::Error::new(io::ErrorKind::Other, "boom");
        let err = StorageError::aborted(inner);
        match err {
            StorageError::Aborted(source) => assert_eq!(source.to_string(), "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
