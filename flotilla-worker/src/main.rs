//! Flotilla Worker
//!
//! Runs on a provisioned VM. Pulls job requests from the jobs queue, runs
//! each workflow through an external command and reports progress to the
//! results topic, exiting once its job budget is spent.
//!
//! Architecture:
//! - Configuration: command-line flags with environment fallbacks
//! - Runner: launches the workflow, captures its output
//! - Heartbeat: keeps a long job from being flagged LOST
//! - Worker: the dequeue, execute, report loop

mod config;
mod heartbeat;
mod params;
mod runner;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use flotilla_broker::PgBroker;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;
use crate::runner::CommandRunner;
use crate::worker::Worker;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flotilla_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Flotilla Worker");

    let config = WorkerConfig::parse();
    config.validate()?;
    info!(
        "Loaded configuration: vm_uuid={}, queue={}, max_jobs={}",
        config.vm_uuid, config.queue_name, config.max_jobs
    );

    let runner = CommandRunner::from_command_line(&config.runner_command, config.runner_image.clone())
        .context("runner_command cannot be empty")?;

    let broker = PgBroker::connect(&config.database_url)
        .await
        .context("Failed to connect to the message transport")?;
    broker
        .run_migrations()
        .await
        .context("Failed to set up message tables")?;

    let worker = Worker::new(&config, Arc::new(broker), Arc::new(runner));
    let processed = worker.run().await?;

    info!("Exiting after {} job(s)", processed);
    Ok(())
}
