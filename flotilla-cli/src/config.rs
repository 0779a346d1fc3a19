//! Configuration module
//!
//! Handles CLI configuration: where the store lives and which queues to use.

use flotilla_broker::QueueNames;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string shared by the store and the broker
    pub database_url: String,

    /// Base name the queue names are derived from
    pub queue_name: String,
}

impl Config {
    pub fn queues(&self) -> QueueNames {
        QueueNames::new(&self.queue_name)
    }
}
