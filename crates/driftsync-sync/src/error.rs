//! Error types for sync operations.

use thiserror::Error;

use driftsync_core::ValidationError;
use driftsync_store::StoreError;

/// Errors that can occur during sync.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote offline")]
    RemoteOffline,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("actor stopped")]
    ActorStopped,
}

impl SyncError {
    /// Whether the failure is a lost link rather than a bad request.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_disconnect() || matches!(e, StoreError::Unavailable),
            SyncError::Transport(_) | SyncError::RemoteOffline | SyncError::ConnectionClosed => {
                true
            }
            _ => false,
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
