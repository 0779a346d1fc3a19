//! In-process broker
//!
//! Queues live in a shared map guarded by a mutex; consumers park on a
//! [`Notify`] until a publish or reject wakes them. Topics are tokio
//! broadcast channels, so each subscriber owns an independent receiver.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::warn;

use crate::error::{BrokerError, Result};
use crate::{Broker, Delivery, Subscription};

const TOPIC_CAPACITY: usize = 1024;

/// Broker that keeps every queue and topic in memory
///
/// Cloning yields another handle to the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<String>>,
    unacked: HashMap<i64, Delivery>,
    topics: HashMap<String, broadcast::Sender<String>>,
    next_tag: i64,
    closed: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shuts the broker down
    ///
    /// Every waiting or future consumer and subscriber observes
    /// [`BrokerError::Closed`].
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
            state.topics.clear();
        }
        self.inner.notify.notify_waiters();
    }

    /// Number of messages waiting in a queue, excluding unacked deliveries
    pub fn queue_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Number of deliveries handed out but not yet acked or rejected
    pub fn unacked_len(&self) -> usize {
        self.inner.state.lock().unwrap().unacked.len()
    }

    fn try_take(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(BrokerError::Closed);
        }

        let Some(body) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery = Delivery {
            tag: state.next_tag,
            queue: queue.to_string(),
            body,
        };
        state.unacked.insert(delivery.tag, delivery.clone());
        Ok(Some(delivery))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, body: &str) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(body.to_string());
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, timeout: Option<Duration>) -> Result<Option<Delivery>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // Register interest before checking so a publish in between is not missed
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue)? {
                return Ok(Some(delivery));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        state.unacked.remove(&delivery.tag);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(delivery) = state.unacked.remove(&delivery.tag) {
                state
                    .queues
                    .entry(delivery.queue)
                    .or_default()
                    .push_front(delivery.body);
            }
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn broadcast(&self, topic: &str, body: &str) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let sender = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        // No subscribers means nobody is listening; the message is dropped
        let _ = sender.send(body.to_string());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        let receiver = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();
        Ok(Box::new(MemorySubscription { receiver }))
    }
}

/// Subscriber handle returned by [`MemoryBroker::subscribe`]
pub struct MemorySubscription {
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self, timeout: Option<Duration>) -> Result<Option<String>> {
        loop {
            let received = match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, self.receiver.recv()).await {
                    Ok(received) => received,
                    Err(_) => return Ok(None),
                },
                None => self.receiver.recv().await,
            };

            match received {
                Ok(body) => return Ok(Some(body)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} message(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BrokerError::Closed),
            }
        }
    }
}
