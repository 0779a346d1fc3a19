//! Flotilla persistence
//!
//! Durable record of Jobs and Provisions. The coordinator's duties and the
//! CLI only see the [`JobRepository`] and [`ProvisionRepository`] traits;
//! [`PgStore`] backs them with PostgreSQL and [`MemoryStore`] keeps
//! everything in process.
//!
//! State writes are guarded by the lifecycle rules in `flotilla_core`: an
//! update only lands when the stored state may legally move to the target,
//! so a late PENDING can never overwrite a SUCCESS.

pub mod db;
pub mod error;
mod memory;
mod pg;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use pg::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotilla_core::domain::job::{Job, JobState};
use flotilla_core::domain::provision::{Provision, ProvisionState};
use uuid::Uuid;

/// Job persistence operations
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Stores a new job and returns its UUID
    ///
    /// Storing a UUID that already exists is a no-op, so a redelivered order
    /// cannot create a second row for the same job.
    async fn create_job(&self, job: &Job) -> Result<Uuid>;

    /// Finds a job by UUID
    async fn find_job(&self, job_uuid: Uuid) -> Result<Option<Job>>;

    /// Moves a job to `state` and records the VM running it
    ///
    /// A `None` VM keeps the stored one. Returns false when the job does not
    /// exist or its current state may not move to `state`.
    async fn update_job(&self, job_uuid: Uuid, vm_uuid: Option<Uuid>, state: JobState)
    -> Result<bool>;

    /// Records captured runner output; `None` keeps what is stored
    async fn update_job_output(
        &self,
        job_uuid: Uuid,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<()>;

    /// Marks a RUNNING job LOST if it has not been updated since `cutoff`
    ///
    /// Returns false when the job is missing, no longer RUNNING, or was
    /// refreshed at or after `cutoff`.
    async fn mark_lost(&self, job_uuid: Uuid, cutoff: DateTime<Utc>) -> Result<bool>;

    /// Marks a job SUCCESS; re-finishing a finished job returns false
    async fn finish_job(&self, job_uuid: Uuid) -> Result<bool>;

    /// Lists jobs, optionally only those in one state
    async fn get_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>>;

    /// True if a job with this hash exists in any state but FAILED or LOST
    async fn previously_run(&self, job_hash: &str) -> Result<bool>;
}

/// Provision persistence operations
#[async_trait]
pub trait ProvisionRepository: Send + Sync {
    /// Stores a new provision row and returns its id
    async fn create_provision(&self, provision: &Provision) -> Result<i64>;

    /// Updates every row for a provision UUID; `None` fields keep stored values
    async fn update_provision_by_provision_uuid(
        &self,
        provision_uuid: Uuid,
        job_uuid: Option<Uuid>,
        state: ProvisionState,
        ip_address: Option<&str>,
    ) -> Result<bool>;

    /// Updates the provision linked to a job, recording which VM took it
    ///
    /// A `None` provision UUID keeps the stored one.
    async fn update_provision_by_job_uuid(
        &self,
        job_uuid: Uuid,
        provision_uuid: Option<Uuid>,
        state: ProvisionState,
        ip_address: Option<&str>,
    ) -> Result<bool>;

    /// Lists current provisions: only the newest row per IP address
    async fn get_provisions(&self, state: Option<ProvisionState>) -> Result<Vec<Provision>>;

    /// Counts provision rows in a state
    async fn get_provision_count(&self, state: ProvisionState) -> Result<i64>;

    /// Counts provisions that are PENDING or RUNNING
    async fn get_desired_vm_count(&self) -> Result<i64>;
}

/// Everything the coordinator needs from persistence
pub trait Store: JobRepository + ProvisionRepository {}

impl<T: JobRepository + ProvisionRepository> Store for T {}

