//! Job loop
//!
//! Takes job requests one at a time, reports RUNNING, runs the workflow with
//! a heartbeat alongside, then reports SUCCESS or FAILED. The loop ends after
//! `max_jobs` jobs or when the transport shuts down.

use anyhow::Result;
use flotilla_broker::{Broker, BrokerError, Delivery, QueueNames};
use flotilla_core::Message;
use flotilla_core::domain::job::{Job, JobState};
use flotilla_core::dto::status::Status;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::heartbeat::Heartbeat;
use crate::params::write_parameter_file;
use crate::runner::{RunOutput, RunnerError, WorkflowRunner};

const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct Worker {
    broker: Arc<dyn Broker>,
    runner: Arc<dyn WorkflowRunner>,
    queues: QueueNames,
    vm_uuid: Uuid,
    max_jobs: u32,
    heartbeat_period: Duration,
    retry_delay: Duration,
}

impl Worker {
    pub fn new(
        config: &WorkerConfig,
        broker: Arc<dyn Broker>,
        runner: Arc<dyn WorkflowRunner>,
    ) -> Self {
        Self {
            broker,
            runner,
            queues: config.queues(),
            vm_uuid: config.vm_uuid,
            max_jobs: config.max_jobs,
            heartbeat_period: config.heartbeat_period(),
            retry_delay: RETRY_DELAY,
        }
    }

    /// Processes job requests until the budget is spent, returning how many
    /// jobs were run
    pub async fn run(&self) -> Result<u32> {
        info!(
            "Worker for VM {} taking up to {} job(s) from {}",
            self.vm_uuid, self.max_jobs, self.queues.jobs
        );

        let mut processed = 0;
        while processed < self.max_jobs {
            // No timeout: an idle VM simply waits for work
            let delivery = match self.broker.consume(&self.queues.jobs, None).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) if e.is_closed() => {
                    info!("Transport closed, worker stopping");
                    break;
                }
                Err(e) => {
                    warn!("Failed to consume job requests, retrying: {}", e);
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            // Acked straight away; if this worker dies the flagger reclaims the job
            if self.ack(&delivery).await.is_err() {
                info!("Transport closed, worker stopping");
                break;
            }

            if delivery.body.trim().is_empty() {
                warn!("Received an empty job request, ignoring");
                continue;
            }

            let job = match Job::from_message(&delivery.body) {
                Ok(job) => job,
                Err(e) => {
                    warn!("Skipping malformed job request: {}", e);
                    continue;
                }
            };

            processed += 1;
            if self.execute(job).await.is_err() {
                info!("Transport closed, worker stopping");
                break;
            }
        }

        info!("Worker finished after {} job(s)", processed);
        Ok(processed)
    }

    /// Runs one job and reports its outcome
    ///
    /// Returns the state that was reported, or `None` when the runner
    /// crashed and nothing terminal was sent. Fails only once the transport
    /// has closed.
    async fn execute(&self, job: Job) -> std::result::Result<Option<JobState>, BrokerError> {
        info!(
            job_uuid = %job.job_uuid,
            "Starting {} {}",
            job.workflow_name,
            job.workflow_version
        );
        self.report(&Status::job(
            self.vm_uuid,
            job.job_uuid,
            JobState::Running,
            "job is starting",
        ))
        .await?;

        let job_uuid = job.job_uuid;
        let heartbeat = Heartbeat::start(
            self.broker.clone(),
            self.queues.results.clone(),
            self.vm_uuid,
            job_uuid,
            self.heartbeat_period,
        );
        let outcome = self.run_workflow(job).await;
        drop(heartbeat);

        let status = match outcome {
            Ok(Ok(output)) => {
                info!(job_uuid = %job_uuid, "Job finished");
                Status::job(self.vm_uuid, job_uuid, JobState::Success, "job is finished")
                    .with_output(Some(output.stdout), Some(output.stderr))
            }
            Ok(Err(e)) => {
                warn!(job_uuid = %job_uuid, "Job failed: {}", e);
                let RunOutput { stdout, stderr } = e.output().cloned().unwrap_or_default();
                Status::job(self.vm_uuid, job_uuid, JobState::Failed, e.to_string())
                    .with_output(Some(stdout), Some(stderr))
            }
            Err(e) => {
                error!(
                    job_uuid = %job_uuid,
                    "Runner crashed, leaving job to the lost-job flagger: {}",
                    e
                );
                return Ok(None);
            }
        };

        self.report(&status).await?;
        Ok(Some(status.state))
    }

    /// Writes the parameter file and runs the workflow in its own task so a
    /// panicking runner does not take the worker down
    async fn run_workflow(
        &self,
        job: Job,
    ) -> std::result::Result<std::result::Result<RunOutput, RunnerError>, tokio::task::JoinError>
    {
        let params = match write_parameter_file(&job) {
            Ok(params) => params,
            Err(e) => return Ok(Err(RunnerError::Launch(e))),
        };
        let path: PathBuf = params.path().to_path_buf();
        let runner = self.runner.clone();

        let outcome = tokio::spawn(async move { runner.run(&job, &path).await }).await;
        drop(params);
        outcome
    }

    /// Sends a Status to the results topic, retrying until it is delivered
    /// or the transport closes
    async fn report(&self, status: &Status) -> std::result::Result<(), BrokerError> {
        let body = match status.to_message() {
            Ok(body) => body,
            Err(e) => {
                error!("Failed to encode {} status: {}", status.state, e);
                return Ok(());
            }
        };

        loop {
            match self.broker.broadcast(&self.queues.results, &body).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_closed() => return Err(e),
                Err(e) => {
                    warn!("Failed to report {}, retrying: {}", status.state, e);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> std::result::Result<(), BrokerError> {
        loop {
            match self.broker.ack(delivery).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_closed() => return Err(e),
                Err(e) => {
                    warn!("Failed to acknowledge job request, retrying: {}", e);
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }
}
