//! Job command handlers
//!
//! Handles listing jobs and viewing one job with its captured output.

use anyhow::{Result, anyhow};
use colored::*;
use flotilla_core::domain::job::{Job, JobState};
use flotilla_store::JobRepository;

use super::Clients;
use crate::id_resolver::resolve_job_id;
use crate::types::IdOrPrefix;

/// List jobs, optionally in one state
pub async fn list_jobs(clients: &Clients, state: Option<JobState>) -> Result<()> {
    let jobs = clients.store.get_jobs(state).await?;

    if jobs.is_empty() {
        match state {
            Some(state) => println!("{}", format!("No {} jobs found.", state).yellow()),
            None => println!("{}", "No jobs found.".yellow()),
        }
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

/// Get and display a single job
pub async fn get_job(clients: &Clients, id: &str) -> Result<()> {
    let id_or_prefix = IdOrPrefix::parse(id);
    let uuid = resolve_job_id(clients.store.as_ref(), &id_or_prefix).await?;

    let job = clients
        .store
        .find_job(uuid)
        .await?
        .ok_or_else(|| anyhow!("Job {} not found", uuid))?;

    print_job_details(&job);

    Ok(())
}

/// Print a job summary
fn print_job_summary(job: &Job) {
    println!("  {} Job {}", "▸".cyan(), job.job_uuid.to_string().dimmed());
    println!(
        "    Workflow: {} {}",
        job.workflow_name, job.workflow_version
    );
    println!("    State:    {}", colorize_state(job.state));
    if let Some(updated) = job.last_seen() {
        println!(
            "    Updated:  {}",
            updated.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }
    if let Some(vm) = job.vm_uuid {
        println!("    VM:       {}", vm.to_string().dimmed());
    }
    println!();
}

/// Print detailed job information
fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:        {}", job.job_uuid.to_string().cyan());
    println!("  Workflow:  {} {}", job.workflow_name, job.workflow_version);
    println!("  Path:      {}", job.workflow_path);
    println!("  State:     {}", colorize_state(job.state));
    println!("  Hash:      {}", job.job_hash.dimmed());

    if let Some(created) = job.create_ts {
        println!("  Created:   {}", created.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(updated) = job.update_ts {
        println!("  Updated:   {}", updated.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(vm) = job.vm_uuid {
        println!("  VM:        {}", vm);
    }
    if let Some(user) = &job.end_user {
        println!("  End user:  {}", user);
    }
    if let Some(flavour) = &job.flavour {
        println!("  Flavour:   {}", flavour);
    }

    if !job.arguments.is_empty() {
        println!("\n{}", "Parameters:".bold());
        for (key, value) in &job.arguments {
            println!("  {} = {}", key.cyan(), value);
        }
    }

    if !job.extra_files.is_empty() {
        println!("\n{}", "Extra files:".bold());
        for name in job.extra_files.keys() {
            println!("  {}", name.cyan());
        }
    }

    if let Some(stdout) = job.stdout.as_deref().filter(|s| !s.is_empty()) {
        println!("\n{}", "Stdout:".bold());
        println!("{}", stdout);
    }

    if let Some(stderr) = job.stderr.as_deref().filter(|s| !s.is_empty()) {
        println!("\n{}", "Stderr:".bold());
        println!("{}", stderr.red());
    }
}

/// Colorize job state for display
fn colorize_state(state: JobState) -> ColoredString {
    let text = state.as_str();
    match state {
        JobState::Start => text.dimmed(),
        JobState::Pending => text.yellow(),
        JobState::Running => text.cyan(),
        JobState::Success => text.green(),
        JobState::Failed => text.red(),
        JobState::Lost => text.magenta(),
    }
}
