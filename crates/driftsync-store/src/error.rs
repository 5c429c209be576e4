//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Commit serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The handle was closed.
    #[error("store is closed")]
    Closed,

    /// The backing went away underneath an open handle.
    #[error("store disconnected: {0}")]
    Disconnected(String),

    /// A reconnect is pending. Retry after the reconnect delay.
    #[error("store unavailable while reconnecting")]
    Unavailable,

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for failures that should move a handle into the reconnect path.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, StoreError::Disconnected(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
