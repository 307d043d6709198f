//! Error types for the directory.

use reldir_codec::CodecError;
use reldir_storage::StorageError;
use thiserror::Error;

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Machine-readable error category, for mapping onto transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The request is malformed.
    InvalidArgument,
    /// The addressed entity does not exist.
    NotFound,
    /// The entity already exists.
    AlreadyExists,
    /// The system is not in a state that allows the operation.
    FailedPrecondition,
    /// The operation was aborted by a concurrency conflict.
    Aborted,
    /// The caller cancelled the operation.
    Cancelled,
    /// A deadline expired before the operation could complete.
    DeadlineExceeded,
    /// An internal invariant was violated.
    Internal,
    /// Anything else.
    Unknown,
}

/// Errors that can occur in directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// Storage engine error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Value encoding error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error outside the storage engine (backups).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A request argument is missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An object failed validation.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// A relation failed validation.
    #[error("invalid relation: {0}")]
    InvalidRelation(String),

    /// A manifest could not be compiled.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A message failed structural validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A stored key does not have the expected layout.
    #[error("invalid key format: {0}")]
    KeyFormat(String),

    /// A bucket is missing.
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// A key is missing.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A key that must be new already exists.
    #[error("key already exists: {0}")]
    KeyExists(String),

    /// A lookup expected to be unique matched several entries.
    #[error("multiple results for {0}")]
    MultipleResults(String),

    /// The caller's etag does not match the stored one.
    #[error("hash mismatch on {key}: stored etag differs from {etag}")]
    HashMismatch {
        /// Key of the stale record.
        key: String,
        /// Etag supplied by the caller.
        etag: String,
    },

    /// The object type is not declared in the model.
    #[error("object type not found: {0}")]
    ObjectTypeNotFound(String),

    /// The relation is not declared on the object type.
    #[error("relation not found: {0}")]
    RelationNotFound(String),

    /// The permission is not declared on the object type.
    #[error("permission not found: {0}")]
    PermissionNotFound(String),

    /// A graph anchor is neither the object nor the subject of the query.
    #[error("graph anchor must equal either the object or the subject: {0}")]
    GraphDirectionality(String),

    /// An evaluation walked deeper than the configured limit.
    #[error("maximum depth {0} exceeded")]
    MaxDepthExceeded(usize),

    /// A manifest update would orphan stored data.
    #[error("cannot update model: {0}")]
    CannotUpdateModel(String),

    /// The stored schema version is newer than this build understands.
    #[error("incompatible schema version: found {found}, supported up to {supported}")]
    IncompatibleVersion {
        /// Version stamp found in the database.
        found: String,
        /// Newest version this build can open.
        supported: String,
    },

    /// A migration step failed.
    #[error("migration to {version} failed: {message}")]
    MigrationFailed {
        /// Target version of the failing step.
        version: String,
        /// Description of the failure.
        message: String,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unclassified failure.
    #[error("{0}")]
    Unknown(String),
}

impl DirectoryError {
    /// Creates an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Creates a key-format error.
    pub fn key_format(message: impl Into<String>) -> Self {
        Self::KeyFormat(message.into())
    }

    /// Creates a migration failure for the step targeting `version`.
    pub fn migration_failed(version: impl ToString, message: impl Into<String>) -> Self {
        Self::MigrationFailed {
            version: version.to_string(),
            message: message.into(),
        }
    }

    /// Returns the machine-readable category of the error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_)
            | Self::InvalidObject(_)
            | Self::InvalidRelation(_)
            | Self::InvalidManifest(_)
            | Self::Validation(_)
            | Self::ObjectTypeNotFound(_)
            | Self::RelationNotFound(_)
            | Self::PermissionNotFound(_)
            | Self::GraphDirectionality(_)
            | Self::Config(_) => ErrorCode::InvalidArgument,
            Self::PathNotFound(_) | Self::KeyNotFound(_) => ErrorCode::NotFound,
            Self::KeyExists(_) => ErrorCode::AlreadyExists,
            Self::MultipleResults(_)
            | Self::CannotUpdateModel(_)
            | Self::MaxDepthExceeded(_)
            | Self::IncompatibleVersion { .. } => ErrorCode::FailedPrecondition,
            Self::HashMismatch { .. } => ErrorCode::Aborted,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Storage(StorageError::Timeout) => ErrorCode::DeadlineExceeded,
            Self::Storage(err) if err.is_not_found() => ErrorCode::NotFound,
            Self::Storage(_)
            | Self::Codec(_)
            | Self::Io(_)
            | Self::KeyFormat(_)
            | Self::MigrationFailed { .. } => ErrorCode::Internal,
            Self::Unknown(_) => ErrorCode::Unknown,
        }
    }

    /// Returns true for errors that say the addressed record is absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code() == ErrorCode::NotFound
    }
}

impl From<StorageError> for DirectoryError {
    fn from(err: StorageError) -> Self {
        match err {
            // Directory errors raised inside a write closure travel through
            // the engine boxed; hand them back unchanged.
            StorageError::Aborted(source) => match source.downcast::<DirectoryError>() {
                Ok(inner) => *inner,
                Err(other) => Self::Storage(StorageError::Aborted(other)),
            },
            other => Self::Storage(other),
        }
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(CodecError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes() {
        assert_eq!(
            DirectoryError::HashMismatch {
                key: "user:alice".into(),
                etag: "1".into()
            }
            .code(),
            ErrorCode::Aborted
        );
        assert_eq!(
            DirectoryError::KeyNotFound("user:alice".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            DirectoryError::from(StorageError::Timeout).code(),
            ErrorCode::DeadlineExceeded
        );
        assert_eq!(
            DirectoryError::CannotUpdateModel("x".into()).code(),
            ErrorCode::FailedPrecondition
        );
    }

    #[test]
    fn aborted_storage_error_unwraps_directory_error() {
        let err = StorageError::aborted(DirectoryError::ObjectTypeNotFound("robot".into()));
        match DirectoryError::from(err) {
            DirectoryError::ObjectTypeNotFound(name) => assert_eq!(name, "robot"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn foreign_aborted_error_stays_storage() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = DirectoryError::from(StorageError::aborted(inner));
        assert!(matches!(err, DirectoryError::Storage(StorageError::Aborted(_))));
        assert_eq!(err.code(), ErrorCode::Internal);
    }
}
