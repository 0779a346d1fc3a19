//! Coordinator duties
//!
//! Each duty is an independent loop over one message source or the store.
//! Duties share nothing in process; they only meet through the broker and
//! the store.

pub mod flagger;
pub mod intake;
pub mod reaper;

pub use flagger::LostJobFlagger;
pub use intake::OrderIntake;
pub use reaper::ResultReaper;

use flotilla_broker::BrokerError;
use flotilla_core::CodecError;
use flotilla_store::StoreError;
use thiserror::Error;

/// Errors that end a duty
#[derive(Debug, Error)]
pub enum DutyError {
    #[error("transport error: {0}")]
    Broker(#[from] BrokerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("encoding error: {0}")]
    Codec(#[from] CodecError),
}

impl DutyError {
    /// True when the transport was shut down under the duty
    pub fn is_shutdown(&self) -> bool {
        matches!(self, DutyError::Broker(e) if e.is_closed())
    }
}

pub type Result<T> = std::result::Result<T, DutyError>;
