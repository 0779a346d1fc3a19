//! Lost-job flagger
//!
//! A crashed worker sends no final status, so its job would stay RUNNING
//! forever. Each pass marks RUNNING jobs that have not been updated within
//! the threshold as LOST. Passes are independent and safe to repeat.

use chrono::{DateTime, Utc};
use flotilla_core::domain::job::JobState;
use flotilla_core::domain::provision::ProvisionState;
use flotilla_store::{JobRepository, ProvisionRepository, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Result;
use crate::config::CoordinatorConfig;

pub struct LostJobFlagger {
    store: Arc<dyn Store>,
    threshold: chrono::Duration,
    interval: Duration,
    endless: bool,
}

impl LostJobFlagger {
    pub fn new(config: &CoordinatorConfig, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            threshold: config.lost_threshold(),
            interval: config.flag_interval(),
            endless: config.endless,
        }
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Lost-job flagger scanning every {:?}, threshold {}s",
            self.interval,
            self.threshold.num_seconds()
        );

        loop {
            self.flag_pass(Utc::now()).await?;

            if !self.endless {
                return Ok(());
            }

            tokio::select! {
                _ = token.cancelled() => {
                    info!("Lost-job flagger shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Marks stale RUNNING jobs LOST as of `now`, returning how many changed
    ///
    /// The write re-checks the job's last update, so a heartbeat reaped after
    /// the scan keeps the job RUNNING.
    pub async fn flag_pass(&self, now: DateTime<Utc>) -> Result<usize> {
        let running = self.store.get_jobs(Some(JobState::Running)).await?;
        debug!("Checking {} running job(s)", running.len());

        let cutoff = now - self.threshold;
        let mut flagged = 0;
        for job in running {
            let Some(last_seen) = job.last_seen() else {
                continue;
            };

            let elapsed = now - last_seen;
            if elapsed <= self.threshold {
                continue;
            }

            if !self.store.mark_lost(job.job_uuid, cutoff).await? {
                debug!("Job {} was updated during the scan, keeping it", job.job_uuid);
                continue;
            }

            warn!(
                job_uuid = %job.job_uuid,
                elapsed_secs = elapsed.num_seconds(),
                threshold_secs = self.threshold.num_seconds(),
                "Job marked LOST after {}s without an update (threshold {}s)",
                elapsed.num_seconds(),
                self.threshold.num_seconds()
            );
            // The VM behind a lost job is not coming back
            self.store
                .update_provision_by_job_uuid(job.job_uuid, None, ProvisionState::Failed, None)
                .await?;
            flagged += 1;
        }

        Ok(flagged)
    }
}
