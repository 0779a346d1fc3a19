//! PostgreSQL-backed broker
//!
//! Queues are rows in `queue_message`. A consumer leases the oldest unleased
//! row with `FOR UPDATE SKIP LOCKED`, so competing consumers never receive
//! the same message at once. Acking deletes the row; a lease that expires
//! without an ack makes the message visible again.
//!
//! Topics are rows in `topic_message`, each stamped with the id of the
//! transaction that wrote it. Sequence ids are handed out before commit, so
//! a subscriber cannot simply read past the highest id it has seen: a
//! broadcast with a lower id may still be in flight. Subscribers instead
//! walk rows in `(tx_id, message_id)` order and only read rows whose
//! transaction is older than every transaction still running. Anything
//! committed later is guaranteed to sort after the cursor. A long-running
//! transaction elsewhere in the database delays delivery until it ends.
//!
//! Topic rows are pruned once they are older than the retention window.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::{Broker, Delivery, Subscription};

const DEFAULT_LEASE: Duration = Duration::from_secs(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_TOPIC_RETENTION: Duration = Duration::from_secs(3600);
const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Oldest transaction id still running, as seen by the current statement
const SNAPSHOT_XMIN: &str = "pg_snapshot_xmin(pg_current_snapshot())::TEXT::BIGINT";

/// Broker storing queues and topics in PostgreSQL tables
#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
    lease: Duration,
    poll_interval: Duration,
    topic_retention: Duration,
    prune_interval: Duration,
    last_prune: Arc<Mutex<Instant>>,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease: DEFAULT_LEASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            topic_retention: DEFAULT_TOPIC_RETENTION,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            last_prune: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Opens a connection pool of its own
    ///
    /// For processes that only need the transport, such as workers.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// How long a delivery stays invisible to other consumers without an ack
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// How often an idle consumer re-checks its queue
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long topic messages are kept
    ///
    /// Must comfortably exceed how far any subscriber may fall behind.
    pub fn with_topic_retention(mut self, retention: Duration) -> Self {
        self.topic_retention = retention;
        self
    }

    /// Creates the broker tables if they do not exist
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_message (
                message_id BIGSERIAL PRIMARY KEY,
                queue VARCHAR(255) NOT NULL,
                body TEXT NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                leased_until TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_message_queue ON queue_message(queue, message_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS topic_message (
                message_id BIGSERIAL PRIMARY KEY,
                topic VARCHAR(255) NOT NULL,
                body TEXT NOT NULL,
                tx_id BIGINT NOT NULL DEFAULT (pg_current_xact_id()::TEXT::BIGINT),
                published_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Tables created before tx_id existed
        sqlx::query(
            r#"
            ALTER TABLE topic_message
            ADD COLUMN IF NOT EXISTS tx_id BIGINT NOT NULL DEFAULT (pg_current_xact_id()::TEXT::BIGINT)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_topic_message_tx ON topic_message(topic, tx_id, message_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_topic_message_published ON topic_message(published_at)",
        )
        .execute(&self.pool)
        .await?;

        debug!("Broker tables ready");
        Ok(())
    }

    /// Deletes topic messages older than the retention window
    pub async fn prune_topics(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM topic_message WHERE published_at < NOW() - make_interval(secs => $1)",
        )
        .bind(self.topic_retention.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            debug!("Pruned {} topic message(s)", pruned);
        }
        Ok(pruned)
    }

    /// True at most once per prune interval
    fn prune_due(&self) -> bool {
        let mut last = self.last_prune.lock().unwrap();
        if last.elapsed() < self.prune_interval {
            return false;
        }
        *last = Instant::now();
        true
    }

    async fn try_lease(&self, queue: &str) -> Result<Option<Delivery>> {
        let row = sqlx::query_as::<_, (i64, String)>(
            r#"
            UPDATE queue_message
            SET leased_until = NOW() + make_interval(secs => $2)
            WHERE message_id = (
                SELECT message_id
                FROM queue_message
                WHERE queue = $1 AND (leased_until IS NULL OR leased_until < NOW())
                ORDER BY message_id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING message_id, body
            "#,
        )
        .bind(queue)
        .bind(self.lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(tag, body)| Delivery {
            tag,
            queue: queue.to_string(),
            body,
        }))
    }
}

/// Sleeps one poll interval, or returns false once the deadline has passed
async fn wait_for_poll(poll_interval: Duration, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
            true
        }
        None => {
            tokio::time::sleep(poll_interval).await;
            true
        }
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, queue: &str, body: &str) -> Result<()> {
        sqlx::query("INSERT INTO queue_message (queue, body) VALUES ($1, $2)")
            .bind(queue)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, timeout: Option<Duration>) -> Result<Option<Delivery>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(delivery) = self.try_lease(queue).await? {
                return Ok(Some(delivery));
            }
            if !wait_for_poll(self.poll_interval, deadline).await {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("DELETE FROM queue_message WHERE message_id = $1")
            .bind(delivery.tag)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("UPDATE queue_message SET leased_until = NULL WHERE message_id = $1")
            .bind(delivery.tag)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn broadcast(&self, topic: &str, body: &str) -> Result<()> {
        sqlx::query("INSERT INTO topic_message (topic, body) VALUES ($1, $2)")
            .bind(topic)
            .bind(body)
            .execute(&self.pool)
            .await?;

        if self.prune_due() {
            if let Err(e) = self.prune_topics().await {
                warn!("Failed to prune topic messages: {}", e);
            }
        }
        Ok(())
    }

    /// Joins a topic
    ///
    /// Reading starts at the oldest transaction still running, so a message
    /// committed just before this call may also be seen.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>> {
        let xmin: i64 = sqlx::query_scalar(&format!("SELECT {}", SNAPSHOT_XMIN))
            .fetch_one(&self.pool)
            .await?;

        Ok(Box::new(PgSubscription {
            pool: self.pool.clone(),
            topic: topic.to_string(),
            cursor: TopicCursor::starting_at(xmin),
            poll_interval: self.poll_interval,
        }))
    }
}

/// Position in a topic: the last `(tx_id, message_id)` read
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TopicCursor {
    tx_id: i64,
    message_id: i64,
}

impl TopicCursor {
    /// Cursor that reads every row written by `tx_id` or later
    fn starting_at(tx_id: i64) -> Self {
        Self {
            tx_id,
            message_id: 0,
        }
    }
}

/// Subscriber handle returned by [`PgBroker::subscribe`]
pub struct PgSubscription {
    pool: PgPool,
    topic: String,
    cursor: TopicCursor,
    poll_interval: Duration,
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn next(&mut self, timeout: Option<Duration>) -> Result<Option<String>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let row = sqlx::query_as::<_, (i64, i64, String)>(&format!(
                r#"
                SELECT tx_id, message_id, body
                FROM topic_message
                WHERE topic = $1
                  AND (tx_id > $2 OR (tx_id = $2 AND message_id > $3))
                  AND tx_id < {}
                ORDER BY tx_id, message_id
                LIMIT 1
                "#,
                SNAPSHOT_XMIN
            ))
            .bind(&self.topic)
            .bind(self.cursor.tx_id)
            .bind(self.cursor.message_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((tx_id, message_id, body)) = row {
                self.cursor = TopicCursor { tx_id, message_id };
                return Ok(Some(body));
            }
            if !wait_for_poll(self.poll_interval, deadline).await {
                return Ok(None);
            }
        }
    }
}
