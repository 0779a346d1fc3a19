//! Error types for the flotilla broker

use thiserror::Error;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur when talking to the transport
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The transport was shut down; consumers should stop cleanly
    #[error("broker connection closed")]
    Closed,

    /// The backing database rejected an operation
    #[error("broker database error: {0}")]
    Database(sqlx::Error),
}

impl BrokerError {
    /// Check if this error signals transport shutdown
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => BrokerError::Closed,
            other => BrokerError::Database(other),
        }
    }
}
