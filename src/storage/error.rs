//! Storage-specific error types.
//!
//! All storage operations return [`StorageError`] on failure, which can be
//! matched to determine the underlying cause.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed (sqlx error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store cannot be reached (pool closed, connection lost).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Internal error (e.g., failed to create the database directory).
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid data handed to or read from the store.
    #[error("invalid data: {0}")]
    InvalidData(String),
}
