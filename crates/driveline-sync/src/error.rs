//! Error types for the sync module.

use driveline_core::{DriveId, ListenerId};
use thiserror::Error;

/// Errors that can occur during synchronization operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] driveline_store::StoreError),

    /// No listener registered under this id.
    #[error("listener not found: {drive_id}/{listener_id}")]
    ListenerNotFound {
        drive_id: DriveId,
        listener_id: ListenerId,
    },

    /// Listener or transmitter misconfiguration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Drive state could not be interpreted.
    #[error("invalid drive state: {0}")]
    InvalidDrive(String),

    /// Push or pull transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire payload encoding/decoding failure.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
