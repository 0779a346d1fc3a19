//! Order intake
//!
//! Consumes Orders, drops those whose job hash was already run, and fans the
//! rest out into a VM request and a job request before recording the job as
//! PENDING. The Order is acknowledged only once all of that has succeeded,
//! so a crash part way through leads to redelivery rather than loss.

use flotilla_broker::{Broker, Delivery, QueueNames};
use flotilla_core::Message;
use flotilla_core::domain::job::{Job, JobState};
use flotilla_core::domain::provision::{Provision, ProvisionState};
use flotilla_core::dto::order::Order;
use flotilla_store::{JobRepository, ProvisionRepository, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::Result;
use crate::config::CoordinatorConfig;

/// What happened to one Order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Fanned out and stored as PENDING
    Admitted(Uuid),
    /// Job hash was already run
    Skipped,
    /// Body could not be decoded; acknowledged and dropped
    Malformed,
    /// A publish failed; the Order went back on the queue
    Requeued,
}

pub struct OrderIntake {
    broker: Arc<dyn Broker>,
    store: Arc<dyn Store>,
    queues: QueueNames,
    check_previous_job_hash: bool,
    idle_timeout: Duration,
    endless: bool,
}

impl OrderIntake {
    pub fn new(config: &CoordinatorConfig, broker: Arc<dyn Broker>, store: Arc<dyn Store>) -> Self {
        Self {
            broker,
            store,
            queues: config.queues(),
            check_previous_job_hash: config.check_previous_job_hash,
            idle_timeout: config.idle_timeout(),
            endless: config.endless,
        }
    }

    /// Consumes Orders until cancelled, or until the queue stays empty for
    /// one idle timeout when running once-through
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!("Order intake consuming from {}", self.queues.orders);

        loop {
            let consumed = tokio::select! {
                _ = token.cancelled() => {
                    info!("Order intake shutting down");
                    return Ok(());
                }
                consumed = self.broker.consume(&self.queues.orders, Some(self.idle_timeout)) => consumed,
            };

            let delivery = match consumed {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    if !self.endless {
                        debug!("Orders queue drained");
                        return Ok(());
                    }
                    continue;
                }
                Err(e) if e.is_closed() => {
                    info!("Transport closed, order intake stopping");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Failed to consume orders, retrying: {}", e);
                    tokio::time::sleep(self.idle_timeout).await;
                    continue;
                }
            };

            match self.handle(&delivery).await {
                Ok(Outcome::Requeued) => {
                    // Give the transport a moment before the Order comes back round
                    tokio::select! {
                        _ = token.cancelled() => {
                            info!("Order intake shutting down");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(self.idle_timeout) => {}
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_shutdown() => {
                    info!("Transport closed, order intake stopping");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Processes one delivered Order
    pub async fn handle(&self, delivery: &Delivery) -> Result<Outcome> {
        let Order { mut job, mut provision } = match Order::from_message(&delivery.body) {
            Ok(order) => order,
            Err(e) => {
                warn!("Skipping malformed order: {}", e);
                self.broker.ack(delivery).await?;
                return Ok(Outcome::Malformed);
            }
        };
        job.ensure_hash();

        if self.check_previous_job_hash {
            match self.store.previously_run(&job.job_hash).await {
                Ok(true) => {
                    info!(
                        job_hash = %job.job_hash,
                        "Skipping order, a job with this hash already ran or is in flight"
                    );
                    self.broker.ack(delivery).await?;
                    return Ok(Outcome::Skipped);
                }
                Ok(false) => {}
                Err(e) => {
                    self.requeue(delivery).await;
                    return Err(e.into());
                }
            }
        }

        job.state = JobState::Pending;
        provision.state = ProvisionState::Pending;
        provision.job_uuid = Some(job.job_uuid);

        for (queue, body) in [
            (&self.queues.vms, provision.to_message()?),
            (&self.queues.jobs, job.to_message()?),
        ] {
            if let Err(e) = self.broker.publish(queue, &body).await {
                if e.is_closed() {
                    return Err(e.into());
                }
                warn!("Failed to publish to {}, requeueing order: {}", queue, e);
                self.requeue(delivery).await;
                return Ok(Outcome::Requeued);
            }
        }

        if let Err(e) = self.record(&job, &provision).await {
            self.requeue(delivery).await;
            return Err(e);
        }

        self.broker.ack(delivery).await?;
        info!(
            job_uuid = %job.job_uuid,
            job_hash = %job.job_hash,
            "Admitted {} {}",
            job.workflow_name,
            job.workflow_version
        );

        Ok(Outcome::Admitted(job.job_uuid))
    }

    async fn record(&self, job: &Job, provision: &Provision) -> Result<()> {
        self.store.create_job(job).await?;
        self.store.create_provision(provision).await?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.reject(delivery).await {
            error!("Failed to return order to {}: {}", delivery.queue, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duty::testing;
    use async_trait::async_trait;
    use flotilla_broker::{BrokerError, MemoryBroker, Subscription};
    use flotilla_store::MemoryStore;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Broker whose first few publishes fail with a transient error
    struct FlakyPublish {
        inner: MemoryBroker,
        failures: AtomicUsize,
        consumed: AtomicUsize,
    }

    #[async_trait]
    impl Broker for FlakyPublish {
        async fn publish(&self, queue: &str, body: &str) -> flotilla_broker::Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(BrokerError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.publish(queue, body).await
        }

        async fn consume(
            &self,
            queue: &str,
            timeout: Option<Duration>,
        ) -> flotilla_broker::Result<Option<Delivery>> {
            self.consumed.fetch_add(1, Ordering::SeqCst);
            self.inner.consume(queue, timeout).await
        }

        async fn ack(&self, delivery: &Delivery) -> flotilla_broker::Result<()> {
            self.inner.ack(delivery).await
        }

        async fn reject(&self, delivery: &Delivery) -> flotilla_broker::Result<()> {
            self.inner.reject(delivery).await
        }

        async fn broadcast(&self, topic: &str, body: &str) -> flotilla_broker::Result<()> {
            self.inner.broadcast(topic, body).await
        }

        async fn subscribe(&self, topic: &str) -> flotilla_broker::Result<Box<dyn Subscription>> {
            self.inner.subscribe(topic).await
        }
    }

    fn order(hash: &str) -> Order {
        let mut args = BTreeMap::new();
        args.insert("k".to_string(), "v".to_string());
        let mut job = Job::new("W", "1.0", "/workflows/W", args);
        job.job_hash = hash.to_string();
        Order::new(job, Provision::new(2, 4, 20))
    }

    fn intake(config: &CoordinatorConfig, broker: &MemoryBroker, store: &MemoryStore) -> OrderIntake {
        OrderIntake::new(config, Arc::new(broker.clone()), Arc::new(store.clone()))
    }

    async fn deliver(broker: &MemoryBroker, queues: &QueueNames, body: &str) -> Delivery {
        broker.publish(&queues.orders, body).await.unwrap();
        broker
            .consume(&queues.orders, Some(Duration::from_millis(10)))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_admitted_order_fans_out_and_is_stored() {
        let config = testing::config();
        let queues = config.queues();
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let order = order("h1");

        let delivery = deliver(&broker, &queues, &order.to_message().unwrap()).await;
        let outcome = intake(&config, &broker, &store).handle(&delivery).await.unwrap();
        assert_eq!(outcome, Outcome::Admitted(order.job.job_uuid));

        assert_eq!(broker.queue_len(&queues.jobs), 1);
        assert_eq!(broker.queue_len(&queues.vms), 1);
        assert_eq!(broker.unacked_len(), 0);

        let vm_request = broker
            .consume(&queues.vms, Some(Duration::from_millis(10)))
            .await
            .unwrap()
            .unwrap();
        let requested = Provision::from_message(&vm_request.body).unwrap();
        assert_eq!(requested.job_uuid, Some(order.job.job_uuid));
        assert_eq!(requested.cores, 2);

        let stored = store.find_job(order.job.job_uuid).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);

        let provisions = store.get_provisions(Some(ProvisionState::Pending)).await.unwrap();
        assert_eq!(provisions.len(), 1);
        assert_eq!(provisions[0].job_uuid, Some(order.job.job_uuid));
    }

    #[tokio::test]
    async fn test_missing_hash_is_computed() {
        let config = testing::config();
        let queues = config.queues();
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let order = order("");

        let delivery = deliver(&broker, &queues, &order.to_message().unwrap()).await;
        intake(&config, &broker, &store).handle(&delivery).await.unwrap();

        let stored = store.find_job(order.job.job_uuid).await.unwrap().unwrap();
        assert_eq!(stored.job_hash, order.job.compute_hash());
    }

    #[tokio::test]
    async fn test_duplicate_hash_is_skipped() {
        let config = testing::config();
        let queues = config.queues();
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let intake = intake(&config, &broker, &store);

        let first = deliver(&broker, &queues, &order("h1").to_message().unwrap()).await;
        intake.handle(&first).await.unwrap();
        let second = deliver(&broker, &queues, &order("h1").to_message().unwrap()).await;
        assert_eq!(intake.handle(&second).await.unwrap(), Outcome::Skipped);

        assert_eq!(store.get_jobs(None).await.unwrap().len(), 1);
        assert_eq!(broker.queue_len(&queues.jobs), 1);
        assert_eq!(broker.unacked_len(), 0);
    }

    #[tokio::test]
    async fn test_failed_hash_may_run_again() {
        let config = testing::config();
        let queues = config.queues();
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let intake = intake(&config, &broker, &store);

        let first = order("h1");
        let delivery = deliver(&broker, &queues, &first.to_message().unwrap()).await;
        intake.handle(&delivery).await.unwrap();
        store
            .update_job(first.job.job_uuid, None, JobState::Failed)
            .await
            .unwrap();

        let retry = deliver(&broker, &queues, &order("h1").to_message().unwrap()).await;
        assert!(matches!(
            intake.handle(&retry).await.unwrap(),
            Outcome::Admitted(_)
        ));
        assert_eq!(store.get_jobs(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dedup_can_be_disabled() {
        let mut config = testing::config();
        config.check_previous_job_hash = false;
        let queues = config.queues();
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        let intake = intake(&config, &broker, &store);

        for _ in 0..2 {
            let delivery = deliver(&broker, &queues, &order("h1").to_message().unwrap()).await;
            intake.handle(&delivery).await.unwrap();
        }

        assert_eq!(store.get_jobs(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_order_is_dropped() {
        let config = testing::config();
        let queues = config.queues();
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();

        let delivery = deliver(&broker, &queues, "{not an order").await;
        let outcome = intake(&config, &broker, &store).handle(&delivery).await.unwrap();

        assert_eq!(outcome, Outcome::Malformed);
        assert_eq!(broker.queue_len(&queues.orders), 0);
        assert_eq!(broker.unacked_len(), 0);
        assert!(store.get_jobs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_queue_once() {
        let config = testing::config();
        let queues = config.queues();
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();

        for hash in ["a", "b", "a"] {
            broker
                .publish(&queues.orders, &order(hash).to_message().unwrap())
                .await
                .unwrap();
        }

        intake(&config, &broker, &store)
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(broker.queue_len(&queues.orders), 0);
        assert_eq!(broker.queue_len(&queues.jobs), 2);
        assert_eq!(store.get_jobs(Some(JobState::Pending)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_when_transport_closes() {
        let mut config = testing::config();
        config.endless = true;
        let broker = MemoryBroker::new();
        let store = MemoryStore::new();
        broker.close();

        intake(&config, &broker, &store)
            .run(CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_requeued_order_waits_before_retry() {
        let config = testing::config();
        let queues = config.queues();
        let memory = MemoryBroker::new();
        let store = MemoryStore::new();
        let order = order("h1");
        memory
            .publish(&queues.orders, &order.to_message().unwrap())
            .await
            .unwrap();

        let broker = Arc::new(FlakyPublish {
            inner: memory.clone(),
            failures: AtomicUsize::new(2),
            consumed: AtomicUsize::new(0),
        });
        let intake = OrderIntake::new(&config, broker.clone(), Arc::new(store.clone()));

        let started = tokio::time::Instant::now();
        intake.run(CancellationToken::new()).await.unwrap();

        // Two failed attempts, the admitting one, then the idle check
        assert_eq!(broker.consumed.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= config.idle_timeout() * 2);
        assert!(store.find_job(order.job.job_uuid).await.unwrap().is_some());
        assert_eq!(memory.queue_len(&queues.orders), 0);
        assert_eq!(memory.unacked_len(), 0);
    }
}
