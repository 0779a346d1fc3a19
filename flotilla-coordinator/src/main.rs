//! Flotilla Coordinator
//!
//! Admits Orders, reaps worker Status messages into the store and flags
//! jobs whose workers went silent. All three duties run concurrently and
//! talk to the rest of the system only through the broker and the store.

mod config;
mod coordinator;
mod duty;

use anyhow::Context;
use clap::Parser;
use flotilla_broker::PgBroker;
use flotilla_store::{PgStore, db};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::CoordinatorConfig;
use crate::coordinator::Coordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flotilla_coordinator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CoordinatorConfig::parse();
    config.validate()?;

    tracing::info!("Starting Flotilla Coordinator...");
    tracing::info!(
        "Queue base '{}', dedup {}, lost after {}s",
        config.queue_name,
        if config.check_previous_job_hash { "on" } else { "off" },
        config.max_seconds_before_lost
    );

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let broker = PgBroker::new(pool.clone());
    broker
        .run_migrations()
        .await
        .context("Failed to set up message tables")?;

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                token.cancel();
            }
        }
    });

    Coordinator::new(config, Arc::new(broker), Arc::new(PgStore::new(pool)))
        .run(token)
        .await
}
