//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error while writing a record.
    #[error("serialization error: {0}")]
    Serialization(#[from] octagon_types::Error),

    /// No record exists for the requested (container, context).
    #[error("no account metadata for {container}/{context}")]
    NotFound { container: String, context: String },

    /// A previous holder of the connection panicked.
    #[error("storage connection poisoned")]
    Poisoned,
}

impl StorageError {
    /// Returns true if this is a missing-record error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
