//! Message codec
//!
//! Every queued message is a UTF-8 JSON object with flat, named fields.
//! Decoding tolerates unknown fields and treats missing ones as defaults so
//! producers and consumers can evolve independently.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

/// A type that travels over a queue as a text record
pub trait Message: Serialize + DeserializeOwned {
    /// Encodes the message as a JSON text record
    fn to_message(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message body, rejecting empty payloads
    fn from_message(body: &str) -> Result<Self, CodecError> {
        if body.trim().is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(serde_json::from_str(body)?)
    }
}

impl Message for crate::domain::job::Job {}
impl Message for crate::domain::provision::Provision {}
impl Message for crate::dto::order::Order {}
impl Message for crate::dto::status::Status {}
