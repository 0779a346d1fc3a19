//! Data Transfer Objects for inter-service communication
//!
//! Orders flow from producers into the coordinator; Status messages flow from
//! workers back to every results subscriber. Neither is persisted.

pub mod order;
pub mod status;
