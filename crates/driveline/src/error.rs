//! Server-level error type, folding the layer errors together.

use thiserror::Error;

use driveline_core::CoreError;

/// Errors surfaced by [`DriveServer`](crate::DriveServer) operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Append engine or reducer failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] driveline_store::StoreError),

    /// Synchronization failure.
    #[error(transparent)]
    Sync(#[from] driveline_sync::SyncError),

    /// An internal receiver name that nothing was registered under.
    #[error("no receiver registered as '{0}'")]
    UnknownReceiver(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
