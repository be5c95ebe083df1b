//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Document or drive serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Drive or document not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Drive or document already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Internal error (runtime/task failures).
    #[error("internal store error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
