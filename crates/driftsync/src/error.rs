//! Error types for the client.

use driftsync_core::{GraphError, MergeError, ValidationError};
use driftsync_store::StoreError;
use driftsync_sync::{ErrorCode, SyncError};
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Merge or materialization failure.
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    /// Graph insertion failure.
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    /// Incoming batch broke causal order.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The application's migrate callback failed.
    #[error("migration failed: {0}")]
    Migration(#[source] anyhow::Error),

    /// The actor reported an unrecoverable failure.
    #[error("fatal {code:?} error: {message}")]
    Fatal { code: ErrorCode, message: String },

    /// The client was shut down.
    #[error("client closed")]
    Closed,
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
