//! Submit command
//!
//! Builds an Order from flags and publishes it to the orders queue. The
//! coordinator decides whether it is admitted.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use flotilla_broker::Broker;
use flotilla_core::Message;
use flotilla_core::domain::job::Job;
use flotilla_core::domain::provision::Provision;
use flotilla_core::dto::order::Order;

use super::Clients;
use crate::types::parse_key_value;

#[derive(Args, Debug, Clone)]
pub struct SubmitArgs {
    /// Workflow name
    #[arg(long)]
    pub workflow: String,

    /// Workflow version
    #[arg(long = "workflow-version")]
    pub workflow_version: String,

    /// Path to the workflow on the worker VMs
    #[arg(long)]
    pub path: String,

    /// Workflow parameter, repeatable
    #[arg(short = 'p', long = "param", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Extra file to ship with the job as name=contents, repeatable
    #[arg(long = "extra-file", value_parser = parse_key_value)]
    pub extra_files: Vec<(String, String)>,

    /// Job hash; computed from workflow and parameters when omitted
    #[arg(long)]
    pub hash: Option<String>,

    #[arg(long, default_value_t = 8)]
    pub cores: i32,

    #[arg(long, default_value_t = 32)]
    pub mem_gb: i32,

    #[arg(long, default_value_t = 512)]
    pub storage_gb: i32,

    /// Who the job is run for
    #[arg(long)]
    pub end_user: Option<String>,

    /// Resource flavour to provision
    #[arg(long)]
    pub flavour: Option<String>,
}

impl SubmitArgs {
    /// Builds the Order these flags describe
    pub fn to_order(&self) -> Order {
        let mut job = Job::new(
            &self.workflow,
            &self.workflow_version,
            &self.path,
            self.params.iter().cloned().collect(),
        );
        job.extra_files = self.extra_files.iter().cloned().collect();
        job.end_user = self.end_user.clone();
        job.flavour = self.flavour.clone();
        if let Some(hash) = &self.hash {
            job.job_hash = hash.clone();
        }

        Order::new(job, Provision::new(self.cores, self.mem_gb, self.storage_gb))
    }
}

/// Publish an Order built from the flags
pub async fn handle_submit(args: SubmitArgs, clients: &Clients) -> Result<()> {
    let order = args.to_order();
    let body = order.to_message()?;

    clients
        .broker
        .publish(&clients.queues.orders, &body)
        .await
        .context("Failed to publish order")?;

    println!("{}", "✓ Order submitted".green().bold());
    println!("  Job ID:   {}", order.job.job_uuid.to_string().cyan());
    println!("  Workflow: {} {}", order.job.workflow_name, order.job.workflow_version);
    println!("  Hash:     {}", order.job.job_hash.dimmed());
    println!("  Queue:    {}", clients.queues.orders.dimmed());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_broker::{MemoryBroker, QueueNames};
    use flotilla_store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn args(hash: Option<&str>) -> SubmitArgs {
        SubmitArgs {
            workflow: "BWA".to_string(),
            workflow_version: "2.6.0".to_string(),
            path: "/workflows/bwa".to_string(),
            params: vec![("sample".to_string(), "s1".to_string())],
            extra_files: Vec::new(),
            hash: hash.map(str::to_string),
            cores: 4,
            mem_gb: 16,
            storage_gb: 100,
            end_user: Some("alice".to_string()),
            flavour: None,
        }
    }

    #[test]
    fn test_order_from_flags() {
        let order = args(None).to_order();
        assert_eq!(order.job.arguments.get("sample").map(String::as_str), Some("s1"));
        assert_eq!(order.job.job_hash, order.job.compute_hash());
        assert_eq!(order.provision.cores, 4);
        assert_eq!(order.job.end_user.as_deref(), Some("alice"));

        assert_eq!(args(Some("h1")).to_order().job.job_hash, "h1");
    }

    #[tokio::test]
    async fn test_submit_publishes_order() {
        let broker = MemoryBroker::new();
        let clients = Clients {
            broker: Arc::new(broker.clone()),
            store: Arc::new(MemoryStore::new()),
            queues: QueueNames::new("test"),
        };

        handle_submit(args(Some("h1")), &clients).await.unwrap();

        let delivery = broker
            .consume(&clients.queues.orders, Some(Duration::from_millis(10)))
            .await
            .unwrap()
            .unwrap();
        let order = Order::from_message(&delivery.body).unwrap();
        assert_eq!(order.job.job_hash, "h1");
        assert_eq!(order.job.workflow_name, "BWA");
    }
}
