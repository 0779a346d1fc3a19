//! In-process store
//!
//! Same guarded semantics as the PostgreSQL store, kept in a mutex. Useful
//! for tests and for embedding the coordinator duties in one process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotilla_core::domain::job::{Job, JobState};
use flotilla_core::domain::provision::{Provision, ProvisionState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::Result;
use crate::{JobRepository, ProvisionRepository};

#[derive(Debug, Default)]
struct State {
    jobs: Vec<Job>,
    provisions: Vec<Provision>,
    next_job_id: i64,
    next_provision_id: i64,
}

/// Store kept entirely in memory; clones share the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides a job's last-update time
    ///
    /// Lets callers simulate a job whose heartbeat stopped some time ago.
    pub fn touch_job(&self, job_uuid: Uuid, at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.jobs.iter_mut().find(|j| j.job_uuid == job_uuid) {
            Some(job) => {
                job.update_ts = Some(at);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<Uuid> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.iter().any(|j| j.job_uuid == job.job_uuid) {
            return Ok(job.job_uuid);
        }

        state.next_job_id += 1;
        let now = Utc::now();
        let mut stored = job.clone();
        stored.job_id = Some(state.next_job_id);
        stored.create_ts = Some(now);
        stored.update_ts = Some(now);
        state.jobs.push(stored);

        Ok(job.job_uuid)
    }

    async fn find_job(&self, job_uuid: Uuid) -> Result<Option<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.iter().find(|j| j.job_uuid == job_uuid).cloned())
    }

    async fn update_job(
        &self,
        job_uuid: Uuid,
        vm_uuid: Option<Uuid>,
        next: JobState,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.iter_mut().find(|j| j.job_uuid == job_uuid) else {
            return Ok(false);
        };
        if !job.state.can_transition_to(next) {
            return Ok(false);
        }

        job.state = next;
        if vm_uuid.is_some() {
            job.vm_uuid = vm_uuid;
        }
        job.update_ts = Some(Utc::now());
        Ok(true)
    }

    async fn update_job_output(
        &self,
        job_uuid: Uuid,
        stdout: Option<&str>,
        stderr: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.job_uuid == job_uuid) {
            if let Some(stdout) = stdout {
                job.stdout = Some(stdout.to_string());
            }
            if let Some(stderr) = stderr {
                job.stderr = Some(stderr.to_string());
            }
            job.update_ts = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_lost(&self, job_uuid: Uuid, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.iter_mut().find(|j| j.job_uuid == job_uuid) else {
            return Ok(false);
        };
        if job.state != JobState::Running || job.last_seen().is_none_or(|seen| seen >= cutoff) {
            return Ok(false);
        }

        job.state = JobState::Lost;
        job.update_ts = Some(Utc::now());
        Ok(true)
    }

    async fn finish_job(&self, job_uuid: Uuid) -> Result<bool> {
        self.update_job(job_uuid, None, JobState::Success).await
    }

    async fn get_jobs(&self, filter: Option<JobState>) -> Result<Vec<Job>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .iter()
            .filter(|j| filter.is_none_or(|s| j.state == s))
            .cloned()
            .collect())
    }

    async fn previously_run(&self, job_hash: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.iter().any(|j| {
            j.job_hash == job_hash && !matches!(j.state, JobState::Failed | JobState::Lost)
        }))
    }
}

#[async_trait]
impl ProvisionRepository for MemoryStore {
    async fn create_provision(&self, provision: &Provision) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.next_provision_id += 1;
        let id = state.next_provision_id;

        let now = Utc::now();
        let mut stored = provision.clone();
        stored.provision_id = Some(id);
        stored.create_ts = Some(now);
        stored.update_ts = Some(now);
        state.provisions.push(stored);

        Ok(id)
    }

    async fn update_provision_by_provision_uuid(
        &self,
        provision_uuid: Uuid,
        job_uuid: Option<Uuid>,
        next: ProvisionState,
        ip_address: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let mut updated = false;
        for provision in state
            .provisions
            .iter_mut()
            .filter(|p| p.provision_uuid == provision_uuid && p.state.can_transition_to(next))
        {
            provision.state = next;
            if job_uuid.is_some() {
                provision.job_uuid = job_uuid;
            }
            if let Some(ip) = ip_address {
                provision.ip_address = Some(ip.to_string());
            }
            provision.update_ts = Some(Utc::now());
            updated = true;
        }
        Ok(updated)
    }

    async fn update_provision_by_job_uuid(
        &self,
        job_uuid: Uuid,
        provision_uuid: Option<Uuid>,
        next: ProvisionState,
        ip_address: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let mut updated = false;
        for provision in state
            .provisions
            .iter_mut()
            .filter(|p| p.job_uuid == Some(job_uuid) && p.state.can_transition_to(next))
        {
            provision.state = next;
            if let Some(provision_uuid) = provision_uuid {
                provision.provision_uuid = provision_uuid;
            }
            if let Some(ip) = ip_address {
                provision.ip_address = Some(ip.to_string());
            }
            provision.update_ts = Some(Utc::now());
            updated = true;
        }
        Ok(updated)
    }

    async fn get_provisions(&self, filter: Option<ProvisionState>) -> Result<Vec<Provision>> {
        let state = self.state.lock().unwrap();

        // Rows without an address group together, like NULL in GROUP BY
        let mut latest: HashMap<Option<&str>, &Provision> = HashMap::new();
        for provision in &state.provisions {
            latest
                .entry(provision.ip_address.as_deref())
                .and_modify(|current| {
                    if provision.provision_id > current.provision_id {
                        *current = provision;
                    }
                })
                .or_insert(provision);
        }

        let mut provisions: Vec<Provision> = latest
            .into_values()
            .filter(|p| filter.is_none_or(|s| p.state == s))
            .cloned()
            .collect();
        provisions.sort_by_key(|p| p.provision_id);
        Ok(provisions)
    }

    async fn get_provision_count(&self, filter: ProvisionState) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state.provisions.iter().filter(|p| p.state == filter).count() as i64)
    }

    async fn get_desired_vm_count(&self) -> Result<i64> {
        let state = self.state.lock().unwrap();
        Ok(state
            .provisions
            .iter()
            .filter(|p| matches!(p.state, ProvisionState::Pending | ProvisionState::Running))
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn job(x: &str) -> Job {
        let mut args = BTreeMap::new();
        args.insert("x".to_string(), x.to_string());
        Job::new("W", "1", "/w", args)
    }

    fn provision_at(ip: Option<&str>, state: ProvisionState) -> Provision {
        let mut provision = Provision::new(1, 1, 1);
        provision.ip_address = ip.map(str::to_string);
        provision.state = state;
        provision
    }

    #[tokio::test]
    async fn test_create_and_find_job() {
        let store = MemoryStore::new();
        let mut job = job("1");
        job.state = JobState::Pending;

        store.create_job(&job).await.unwrap();
        let found = store.find_job(job.job_uuid).await.unwrap().unwrap();

        assert_eq!(found.job_id, Some(1));
        assert_eq!(found.state, JobState::Pending);
        assert!(found.update_ts.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_uuid_is_ignored() {
        let store = MemoryStore::new();
        let job = job("1");

        store.create_job(&job).await.unwrap();
        store.create_job(&job).await.unwrap();

        assert_eq!(store.get_jobs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_previously_run_ignores_failed_and_lost() {
        let store = MemoryStore::new();
        let mut failed = job("1");
        failed.state = JobState::Failed;
        let mut lost = job("2");
        lost.state = JobState::Lost;
        let mut pending = job("3");
        pending.state = JobState::Pending;

        for j in [&failed, &lost, &pending] {
            store.create_job(j).await.unwrap();
        }

        assert!(!store.previously_run(&failed.job_hash).await.unwrap());
        assert!(!store.previously_run(&lost.job_hash).await.unwrap());
        assert!(store.previously_run(&pending.job_hash).await.unwrap());
        assert!(!store.previously_run("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_finish_job_is_idempotent() {
        let store = MemoryStore::new();
        let mut job = job("1");
        job.state = JobState::Running;
        store.create_job(&job).await.unwrap();

        assert!(store.finish_job(job.job_uuid).await.unwrap());
        assert!(!store.finish_job(job.job_uuid).await.unwrap());

        let found = store.find_job(job.job_uuid).await.unwrap().unwrap();
        assert_eq!(found.state, JobState::Success);
    }

    #[tokio::test]
    async fn test_mark_lost_skips_refreshed_job() {
        let store = MemoryStore::new();
        let mut job = job("1");
        job.state = JobState::Running;
        store.create_job(&job).await.unwrap();

        let now = Utc::now();
        let cutoff = now - chrono::Duration::seconds(60);
        store.touch_job(job.job_uuid, now - chrono::Duration::seconds(120));

        // A heartbeat lands between the scan and the write
        assert!(store.update_job(job.job_uuid, None, JobState::Running).await.unwrap());
        assert!(!store.mark_lost(job.job_uuid, cutoff).await.unwrap());
        assert!(store.finish_job(job.job_uuid).await.unwrap());

        let mut stale = self::job("2");
        stale.state = JobState::Running;
        store.create_job(&stale).await.unwrap();
        store.touch_job(stale.job_uuid, now - chrono::Duration::seconds(120));
        assert!(store.mark_lost(stale.job_uuid, cutoff).await.unwrap());
        assert!(!store.mark_lost(stale.job_uuid, cutoff).await.unwrap());
        let found = store.find_job(stale.job_uuid).await.unwrap().unwrap();
        assert_eq!(found.state, JobState::Lost);
    }

    #[tokio::test]
    async fn test_terminal_state_is_not_overwritten() {
        let store = MemoryStore::new();
        let mut job = job("1");
        job.state = JobState::Pending;
        store.create_job(&job).await.unwrap();
        let vm = Uuid::new_v4();

        assert!(store.update_job(job.job_uuid, Some(vm), JobState::Running).await.unwrap());
        assert!(store.update_job(job.job_uuid, None, JobState::Running).await.unwrap());
        assert!(store.update_job(job.job_uuid, None, JobState::Lost).await.unwrap());
        assert!(!store.update_job(job.job_uuid, None, JobState::Success).await.unwrap());
        assert!(!store.update_job(job.job_uuid, None, JobState::Pending).await.unwrap());

        let found = store.find_job(job.job_uuid).await.unwrap().unwrap();
        assert_eq!(found.state, JobState::Lost);
        assert_eq!(found.vm_uuid, Some(vm));
    }

    #[tokio::test]
    async fn test_update_unknown_job_returns_false() {
        let store = MemoryStore::new();
        assert!(!store.update_job(Uuid::new_v4(), None, JobState::Running).await.unwrap());
    }

    #[tokio::test]
    async fn test_job_output_keeps_missing_streams() {
        let store = MemoryStore::new();
        let job = job("1");
        store.create_job(&job).await.unwrap();

        store.update_job_output(job.job_uuid, Some("out"), Some("err")).await.unwrap();
        store.update_job_output(job.job_uuid, None, Some("err2")).await.unwrap();

        let found = store.find_job(job.job_uuid).await.unwrap().unwrap();
        assert_eq!(found.stdout.as_deref(), Some("out"));
        assert_eq!(found.stderr.as_deref(), Some("err2"));
    }

    #[tokio::test]
    async fn test_touch_job_backdates_update() {
        let store = MemoryStore::new();
        let job = job("1");
        store.create_job(&job).await.unwrap();
        let past = Utc::now() - chrono::Duration::seconds(120);

        assert!(store.touch_job(job.job_uuid, past));
        assert!(!store.touch_job(Uuid::new_v4(), past));

        let found = store.find_job(job.job_uuid).await.unwrap().unwrap();
        assert_eq!(found.update_ts, Some(past));
    }

    #[tokio::test]
    async fn test_get_provisions_returns_latest_per_address() {
        let store = MemoryStore::new();
        store.create_provision(&provision_at(Some("10.0.0.1"), ProvisionState::Success)).await.unwrap();
        let latest = store
            .create_provision(&provision_at(Some("10.0.0.1"), ProvisionState::Running))
            .await
            .unwrap();
        store.create_provision(&provision_at(Some("10.0.0.2"), ProvisionState::Pending)).await.unwrap();

        let provisions = store.get_provisions(None).await.unwrap();
        assert_eq!(provisions.len(), 2);

        let first = provisions
            .iter()
            .find(|p| p.ip_address.as_deref() == Some("10.0.0.1"))
            .unwrap();
        assert_eq!(first.provision_id, Some(latest));
        assert_eq!(first.state, ProvisionState::Running);

        let running = store.get_provisions(Some(ProvisionState::Running)).await.unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn test_provision_counts() {
        let store = MemoryStore::new();
        store.create_provision(&provision_at(None, ProvisionState::Pending)).await.unwrap();
        store.create_provision(&provision_at(None, ProvisionState::Running)).await.unwrap();
        store.create_provision(&provision_at(None, ProvisionState::Success)).await.unwrap();

        assert_eq!(store.get_provision_count(ProvisionState::Pending).await.unwrap(), 1);
        assert_eq!(store.get_provision_count(ProvisionState::Failed).await.unwrap(), 0);
        assert_eq!(store.get_desired_vm_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_provision_by_job_records_vm() {
        let store = MemoryStore::new();
        let job_uuid = Uuid::new_v4();
        let mut provision = provision_at(None, ProvisionState::Pending);
        provision.job_uuid = Some(job_uuid);
        store.create_provision(&provision).await.unwrap();
        let vm = Uuid::new_v4();

        assert!(
            store
                .update_provision_by_job_uuid(job_uuid, Some(vm), ProvisionState::Running, Some("10.0.0.9"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_provision_by_job_uuid(Uuid::new_v4(), Some(vm), ProvisionState::Running, None)
                .await
                .unwrap()
        );

        let current = &store.get_provisions(None).await.unwrap()[0];
        assert_eq!(current.provision_uuid, vm);
        assert_eq!(current.ip_address.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_update_provision_by_uuid_respects_terminal_state() {
        let store = MemoryStore::new();
        let provision = provision_at(None, ProvisionState::Pending);
        store.create_provision(&provision).await.unwrap();
        let id = provision.provision_uuid;

        assert!(
            store
                .update_provision_by_provision_uuid(id, None, ProvisionState::Failed, None)
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_provision_by_provision_uuid(id, None, ProvisionState::Running, None)
                .await
                .unwrap()
        );
    }
}
