//! ID resolver module
//!
//! Handles resolution of UUID prefixes to full UUIDs by querying the store.
//! This allows users to specify short, unambiguous prefixes instead of full UUIDs.

use anyhow::{Context, Result, anyhow};
use flotilla_store::JobRepository;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Resolve a job ID or prefix to a full UUID
///
/// If the input is already a full UUID, returns it immediately.
/// Otherwise, fetches all jobs and finds the one matching the prefix.
///
/// # Errors
/// Returns an error if:
/// - No job matches the prefix
/// - Multiple jobs match the prefix (ambiguous)
/// - The store query fails
pub async fn resolve_job_id<S>(store: &S, id_or_prefix: &IdOrPrefix) -> Result<Uuid>
where
    S: JobRepository + ?Sized,
{
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let jobs = store
        .get_jobs(None)
        .await
        .context("Failed to fetch jobs for ID resolution")?;

    let matches: Vec<Uuid> = jobs
        .iter()
        .map(|j| j.job_uuid)
        .filter(|uuid| id_or_prefix.matches(*uuid))
        .collect();

    match matches.len() {
        0 => Err(anyhow!("No job found with ID starting with '{}'", id_or_prefix)),
        1 => Ok(matches[0]),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple jobs: {}",
                id_or_prefix,
                ids.join(", ")
            ))
        }
    }
}
