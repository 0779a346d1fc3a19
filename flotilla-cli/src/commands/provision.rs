//! Provision command handlers

use anyhow::Result;
use colored::*;
use flotilla_core::domain::provision::{Provision, ProvisionState};
use flotilla_store::ProvisionRepository;

use super::Clients;

/// List current provisions, optionally in one state
pub async fn list_provisions(clients: &Clients, state: Option<ProvisionState>) -> Result<()> {
    let provisions = clients.store.get_provisions(state).await?;

    if provisions.is_empty() {
        println!("{}", "No provisions found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} provision(s):", provisions.len()).bold()
        );
        println!();
        for provision in provisions {
            print_provision_summary(&provision);
        }
    }

    Ok(())
}

/// Provision counts per state plus the desired VM count
pub async fn counts(clients: &Clients) -> Result<Vec<(ProvisionState, i64)>> {
    let mut counts = Vec::with_capacity(ProvisionState::ALL.len());
    for state in ProvisionState::ALL {
        counts.push((state, clients.store.get_provision_count(state).await?));
    }
    Ok(counts)
}

pub async fn summary(clients: &Clients) -> Result<()> {
    let counts = counts(clients).await?;
    let desired = clients.store.get_desired_vm_count().await?;

    println!("{}", "Provisions:".bold());
    for (state, count) in counts {
        println!("  {:<8} {}", colorize_state(state), count);
    }
    println!();
    println!("  Desired VMs: {}", desired.to_string().cyan().bold());

    Ok(())
}

fn print_provision_summary(provision: &Provision) {
    println!(
        "  {} Provision {}",
        "▸".cyan(),
        provision.provision_uuid.to_string().dimmed()
    );
    println!("    State:   {}", colorize_state(provision.state));
    println!(
        "    Size:    {} cores, {} GB memory, {} GB storage",
        provision.cores, provision.mem_gb, provision.storage_gb
    );
    if let Some(ip) = &provision.ip_address {
        println!("    Address: {}", ip);
    }
    if let Some(job) = provision.job_uuid {
        println!("    Job:     {}", job.to_string().dimmed());
    }
    println!();
}

fn colorize_state(state: ProvisionState) -> ColoredString {
    let text = state.as_str();
    match state {
        ProvisionState::Start => text.dimmed(),
        ProvisionState::Pending => text.yellow(),
        ProvisionState::Running => text.cyan(),
        ProvisionState::Success => text.green(),
        ProvisionState::Failed => text.red(),
    }
}
