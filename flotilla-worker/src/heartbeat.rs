//! Job heartbeat
//!
//! While a job runs, a background task re-sends RUNNING for it so the
//! coordinator's lost-job flagger sees fresh updates. The task stops when
//! the [`Heartbeat`] is dropped.

use flotilla_broker::Broker;
use flotilla_core::Message;
use flotilla_core::domain::job::JobState;
use flotilla_core::dto::status::Status;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct Heartbeat {
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Starts reporting `job_uuid` alive every `period`
    ///
    /// The first report goes out one period after the start.
    pub fn start(
        broker: Arc<dyn Broker>,
        topic: String,
        vm_uuid: Uuid,
        job_uuid: Uuid,
        period: Duration,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;

                let status = Status::job(vm_uuid, job_uuid, JobState::Running, "job is alive");
                let body = match status.to_message() {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("Failed to encode heartbeat: {}", e);
                        continue;
                    }
                };

                match broker.broadcast(&topic, &body).await {
                    Ok(()) => debug!("Heartbeat sent for job {}", job_uuid),
                    Err(e) if e.is_closed() => break,
                    Err(e) => warn!("Failed to send heartbeat for job {}: {}", job_uuid, e),
                }
            }
        });

        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
