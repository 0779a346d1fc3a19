//! Error types for message decoding and state parsing

use thiserror::Error;

/// Errors raised while encoding or decoding queued messages
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message body was empty or only whitespace
    #[error("empty message body")]
    Empty,

    /// The body was not a valid record for the expected type
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A stored or transmitted state name is not part of the closed set
    #[error("unknown {kind} state: {value}")]
    UnknownState {
        /// Which state machine was being parsed
        kind: &'static str,
        /// The offending value
        value: String,
    },
}
