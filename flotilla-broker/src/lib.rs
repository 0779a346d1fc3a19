//! Flotilla message broker
//!
//! The transport every flotilla process talks through. Two kinds of channel
//! exist:
//!
//! - **Queues** are point-to-point: each message is handed to exactly one
//!   competing consumer and must be acknowledged, or it is redelivered.
//! - **Topics** are fan-out: every subscriber sees every message published
//!   after it subscribed.
//!
//! Two implementations are provided: [`MemoryBroker`] for single-process use
//! and tests, and [`PgBroker`] which keeps messages in PostgreSQL.
//!
//! # Example
//!
//! ```
//! use flotilla_broker::{Broker, MemoryBroker, QueueNames};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> flotilla_broker::Result<()> {
//!     let broker = MemoryBroker::new();
//!     let queues = QueueNames::new("flotilla");
//!
//!     broker.publish(&queues.jobs, "{}").await?;
//!     let delivery = broker
//!         .consume(&queues.jobs, Some(Duration::from_millis(10)))
//!         .await?
//!         .expect("message was published");
//!     broker.ack(&delivery).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
mod memory;
mod postgres;

pub use error::{BrokerError, Result};
pub use memory::{MemoryBroker, MemorySubscription};
pub use postgres::{PgBroker, PgSubscription};

use async_trait::async_trait;
use std::time::Duration;

/// A message taken from a point-to-point queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport-assigned tag used to ack or reject this delivery
    pub tag: i64,
    /// Queue the message was taken from
    pub queue: String,
    /// UTF-8 message body
    pub body: String,
}

/// Transport operations the coordinator and workers rely on
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a message to a point-to-point queue
    async fn publish(&self, queue: &str, body: &str) -> Result<()>;

    /// Takes the next message from a queue
    ///
    /// Waits up to `timeout` for a message to arrive, or forever when no
    /// timeout is given. `Ok(None)` means the wait elapsed.
    async fn consume(&self, queue: &str, timeout: Option<Duration>) -> Result<Option<Delivery>>;

    /// Acknowledges a delivery, removing it for good
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Returns a delivery to its queue for redelivery
    async fn reject(&self, delivery: &Delivery) -> Result<()>;

    /// Publishes a message to every current subscriber of a topic
    async fn broadcast(&self, topic: &str, body: &str) -> Result<()>;

    /// Joins a topic; only messages broadcast after this call are seen
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>>;
}

/// One subscriber's view of a fan-out topic
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next broadcast message, `Ok(None)` on timeout
    async fn next(&mut self, timeout: Option<Duration>) -> Result<Option<String>>;
}

/// Queue names derived from a configured base name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    /// Orders published by producers
    pub orders: String,
    /// Job requests consumed by workers
    pub jobs: String,
    /// VM requests consumed by the provisioner
    pub vms: String,
    /// Fan-out topic carrying Status messages
    pub results: String,
}

impl QueueNames {
    pub fn new(base: &str) -> Self {
        Self {
            orders: format!("{}_orders", base),
            jobs: format!("{}_jobs", base),
            vms: format!("{}_vms", base),
            results: format!("{}_results", base),
        }
    }
}
