//! Result reaper
//!
//! Joins the results topic and applies every job Status to the store. The
//! store refuses backward moves, so a stray PENDING arriving after SUCCESS is
//! dropped rather than reviving the job.

use flotilla_broker::{Broker, QueueNames, Subscription};
use flotilla_core::Message;
use flotilla_core::domain::job::JobState;
use flotilla_core::domain::provision::ProvisionState;
use flotilla_core::dto::status::Status;
use flotilla_store::{JobRepository, ProvisionRepository, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Result;
use crate::config::CoordinatorConfig;

pub struct ResultReaper {
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    queues: QueueNames,
    idle_timeout: Duration,
    endless: bool,
}

impl ResultReaper {
    pub fn new(config: &CoordinatorConfig, broker: Arc<dyn Broker>, store: Arc<dyn Store>) -> Self {
        Self {
            broker,
            store,
            queues: config.queues(),
            idle_timeout: config.idle_timeout(),
            endless: config.endless,
        }
    }

    /// Subscribes to the results topic and processes it until cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut subscription = match self.broker.subscribe(&self.queues.results).await {
            Ok(subscription) => subscription,
            Err(e) if e.is_closed() => {
                info!("Transport closed, result reaper stopping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.process(subscription.as_mut(), token).await
    }

    /// Applies messages from an existing subscription
    ///
    /// Transport and store errors end the loop; timeouts do not.
    pub async fn process(
        &self,
        subscription: &mut dyn Subscription,
        token: CancellationToken,
    ) -> Result<()> {
        info!("Result reaper listening on {}", self.queues.results);

        loop {
            let received = tokio::select! {
                _ = token.cancelled() => {
                    info!("Result reaper shutting down");
                    return Ok(());
                }
                received = subscription.next(Some(self.idle_timeout)) => received,
            };

            let body = match received {
                Ok(Some(body)) => body,
                Ok(None) => {
                    if !self.endless {
                        debug!("Results topic idle");
                        return Ok(());
                    }
                    continue;
                }
                Err(e) if e.is_closed() => {
                    info!("Transport closed, result reaper stopping");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let status = match Status::from_message(&body) {
                Ok(status) => status,
                Err(e) => {
                    warn!("Skipping malformed status: {}", e);
                    continue;
                }
            };

            self.apply(&status).await?;
        }
    }

    /// Applies one Status, returning whether the job record changed
    pub async fn apply(&self, status: &Status) -> Result<bool> {
        if !status.is_job() {
            debug!("Ignoring {:?} status", status.message_type);
            return Ok(false);
        }

        let Some(job_uuid) = status.job_uuid else {
            warn!("Job status without a job UUID: {}", status.message);
            return Ok(false);
        };

        let applied = match status.state {
            JobState::Success => self.store.finish_job(job_uuid).await?,
            JobState::Running | JobState::Failed | JobState::Pending => {
                self.store
                    .update_job(job_uuid, status.vm_uuid, status.state)
                    .await?
            }
            JobState::Start | JobState::Lost => {
                debug!("Ignoring {} status for job {}", status.state, job_uuid);
                return Ok(false);
            }
        };

        if !applied {
            debug!(
                "Status {} not applied to job {}, unknown or already finished",
                status.state, job_uuid
            );
            return Ok(false);
        }

        if status.stdout.is_some() || status.stderr.is_some() {
            self.store
                .update_job_output(job_uuid, status.stdout.as_deref(), status.stderr.as_deref())
                .await?;
        }

        let provision_state = match status.state {
            JobState::Running => Some(ProvisionState::Running),
            JobState::Success => Some(ProvisionState::Success),
            JobState::Failed => Some(ProvisionState::Failed),
            _ => None,
        };
        if let (Some(state), Some(vm_uuid)) = (provision_state, status.vm_uuid) {
            self.store
                .update_provision_by_job_uuid(job_uuid, Some(vm_uuid), state, None)
                .await?;
        }

        debug!("Job {} is now {}", job_uuid, status.state);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duty::testing;
    use flotilla_broker::MemoryBroker;
    use flotilla_core::domain::job::Job;
    use flotilla_core::domain::provision::Provision;
    use flotilla_core::dto::status::MessageType;
    use flotilla_store::MemoryStore;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    async fn stored_job(store: &MemoryStore, state: JobState) -> Job {
        let mut job = Job::new("W", "1", "/w", BTreeMap::new());
        job.state = state;
        store.create_job(&job).await.unwrap();

        let mut provision = Provision::new(1, 1, 1);
        provision.state = ProvisionState::Pending;
        provision.job_uuid = Some(job.job_uuid);
        store.create_provision(&provision).await.unwrap();

        job
    }

    fn reaper(broker: &MemoryBroker, store: &MemoryStore) -> ResultReaper {
        ResultReaper::new(
            &testing::config(),
            Arc::new(broker.clone()),
            Arc::new(store.clone()),
        )
    }

    async fn state_of(store: &MemoryStore, job: &Job) -> JobState {
        store.find_job(job.job_uuid).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn test_running_records_vm_and_provision() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let job = stored_job(&store, JobState::Pending).await;
        let vm = Uuid::new_v4();

        let applied = reaper(&broker, &store)
            .apply(&Status::job(vm, job.job_uuid, JobState::Running, "job is starting"))
            .await
            .unwrap();

        assert!(applied);
        let stored = store.find_job(job.job_uuid).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Running);
        assert_eq!(stored.vm_uuid, Some(vm));

        let provision = &store.get_provisions(None).await.unwrap()[0];
        assert_eq!(provision.state, ProvisionState::Running);
        assert_eq!(provision.provision_uuid, vm);
    }

    #[tokio::test]
    async fn test_success_is_terminal() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let job = stored_job(&store, JobState::Running).await;
        let vm = Uuid::new_v4();
        let reaper = reaper(&broker, &store);

        assert!(
            reaper
                .apply(&Status::job(vm, job.job_uuid, JobState::Success, "job is finished"))
                .await
                .unwrap()
        );
        assert!(
            !reaper
                .apply(&Status::job(vm, job.job_uuid, JobState::Success, "job is finished"))
                .await
                .unwrap()
        );
        assert!(
            !reaper
                .apply(&Status::job(vm, job.job_uuid, JobState::Pending, "stray"))
                .await
                .unwrap()
        );

        assert_eq!(state_of(&store, &job).await, JobState::Success);
        let provision = &store.get_provisions(None).await.unwrap()[0];
        assert_eq!(provision.state, ProvisionState::Success);
    }

    #[tokio::test]
    async fn test_failed_status_keeps_output() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let job = stored_job(&store, JobState::Running).await;
        let status = Status::job(Uuid::new_v4(), job.job_uuid, JobState::Failed, "exit 2")
            .with_output(Some("partial".to_string()), Some("boom".to_string()));

        assert!(reaper(&broker, &store).apply(&status).await.unwrap());

        let stored = store.find_job(job.job_uuid).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.stdout.as_deref(), Some("partial"));
        assert_eq!(stored.stderr.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_non_job_messages_are_ignored() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let job = stored_job(&store, JobState::Pending).await;
        let mut status = Status::job(Uuid::new_v4(), job.job_uuid, JobState::Running, "vm up");
        status.message_type = MessageType::Vm;

        assert!(!reaper(&broker, &store).apply(&status).await.unwrap());
        assert_eq!(state_of(&store, &job).await, JobState::Pending);
    }

    #[tokio::test]
    async fn test_lost_status_from_outside_is_ignored() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let job = stored_job(&store, JobState::Running).await;

        let status = Status::job(Uuid::new_v4(), job.job_uuid, JobState::Lost, "?");
        assert!(!reaper(&broker, &store).apply(&status).await.unwrap());
        assert_eq!(state_of(&store, &job).await, JobState::Running);
    }

    #[tokio::test]
    async fn test_process_skips_malformed_and_drains() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let job = stored_job(&store, JobState::Pending).await;
        let queues = testing::config().queues();
        let reaper = reaper(&broker, &store);

        let mut subscription = broker.subscribe(&queues.results).await.unwrap();
        broker.broadcast(&queues.results, "garbage").await.unwrap();
        broker.broadcast(&queues.results, "").await.unwrap();
        let status = Status::job(Uuid::new_v4(), job.job_uuid, JobState::Success, "done");
        broker
            .broadcast(&queues.results, &status.to_message().unwrap())
            .await
            .unwrap();

        reaper
            .process(subscription.as_mut(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(state_of(&store, &job).await, JobState::Success);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let mut config = testing::config();
        config.endless = true;
        let reaper = ResultReaper::new(&config, Arc::new(broker), Arc::new(store));
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let token = token.clone();
            async move { reaper.run(token).await }
        });
        token.cancel();

        handle.await.unwrap().unwrap();
    }
}
