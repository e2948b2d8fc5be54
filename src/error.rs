//! Error types shared by all storage clients.

use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by storage operations.
///
/// Database conflicts that the emulator recovers from (a duplicate
/// `uniqueKey` on add, a missing row on update) never reach callers; they
/// are folded into the operation result instead.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Caller passed an invalid request, key, or option value.
    #[error("{0}")]
    InvalidArgument(String),

    /// The queue's database file or row is missing.
    #[error("Request queue with id: {0} does not exist.")]
    QueueNotFound(String),

    /// Rename target already exists; the message names the storage family.
    #[error("{0}")]
    NameConflict(String),

    /// Lock prolongation or release on a request that is absent, already
    /// handled, or not currently locked.
    #[error("Request with id: {id} does not exist or is not locked.")]
    RequestNotLocked { id: String },

    /// A storage directory that must already exist does not.
    #[error("Storage directory does not exist: {0}")]
    NotFound(PathBuf),

    /// Filesystem failure with the path it happened on.
    #[error("Storage I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Any other database failure, surfaced unchanged.
    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    /// Payload (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
