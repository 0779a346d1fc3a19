//! Error types for the flotilla store

use flotilla_core::CodecError;
use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by persistence operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database rejected or failed an operation
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be turned back into a domain value
    #[error("corrupt row: {0}")]
    Codec(#[from] CodecError),

    /// A JSON column could not be encoded
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
}
