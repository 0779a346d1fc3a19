//! Flotilla Core
//!
//! Core types and abstractions shared by the flotilla coordinator, worker and CLI.
//!
//! This crate contains:
//! - Domain types: Jobs and Provisions with their lifecycle state machines
//! - DTOs: the Order and Status messages exchanged over the queues
//! - Codec: the text encoding every queued message uses

pub mod codec;
pub mod domain;
pub mod dto;
pub mod error;

pub use codec::Message;
pub use error::CodecError;
