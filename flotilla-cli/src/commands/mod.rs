//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;
mod provision;
mod submit;

pub use submit::SubmitArgs;

use anyhow::Result;
use clap::Subcommand;
use flotilla_broker::{Broker, QueueNames};
use flotilla_core::domain::job::JobState;
use flotilla_core::domain::provision::ProvisionState;
use flotilla_store::Store;
use std::sync::Arc;

/// Connections every command works through
pub struct Clients {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn Store>,
    pub queues: QueueNames,
}

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Publish an Order for the coordinator to admit
    Submit(SubmitArgs),
    /// List jobs
    Jobs {
        /// Only jobs in this state (e.g. RUNNING)
        #[arg(long)]
        state: Option<JobState>,
    },
    /// Show one job, including captured output
    Job {
        /// Job UUID or unambiguous prefix
        id: String,
    },
    /// List current provisions (latest record per VM address)
    Provisions {
        /// Only provisions in this state
        #[arg(long)]
        state: Option<ProvisionState>,
    },
    /// Provision counts per state and desired VM count
    Summary,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, clients: &Clients) -> Result<()> {
    match command {
        Commands::Submit(args) => submit::handle_submit(args, clients).await,
        Commands::Jobs { state } => job::list_jobs(clients, state).await,
        Commands::Job { id } => job::get_job(clients, &id).await,
        Commands::Provisions { state } => provision::list_provisions(clients, state).await,
        Commands::Summary => provision::summary(clients).await,
    }
}
