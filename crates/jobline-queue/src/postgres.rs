//! Durable priority channel backed by the `job_messages` table.
//!
//! A delivery is a lease: claiming a row stamps `locked_until` and the
//! subscription's consumer id. Ack deletes the row; nack clears the lease and
//! moves the row behind its priority level, or marks it dead. A lease that
//! expires without either makes the row claimable again in its old place,
//! which is how a crashed consumer's message comes back.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jobline_core::{Delivery, DeliveryTag, Error, PriorityChannel, Result, Subscription};

use crate::config::ChannelConfig;

fn queue_err(e: sqlx::Error) -> Error {
    Error::Queue(e.to_string())
}

/// A row marked dead by `nack(requeue = false)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadMessage {
    pub id: i64,
    pub body: Vec<u8>,
    pub priority: u8,
    pub deliveries: i32,
}

/// PostgreSQL implementation of PriorityChannel.
#[derive(Clone)]
pub struct PgChannel {
    pool: Pool<Postgres>,
    config: Arc<ChannelConfig>,
    /// Wakes local subscriptions on publish; remote publishers are picked up
    /// by polling.
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl PgChannel {
    /// Open the channel. The table is created by the jobline-db migrations.
    pub fn new(pool: Pool<Postgres>, config: ChannelConfig) -> Self {
        info!(
            subsystem = "queue",
            component = "postgres",
            queue = %config.name,
            max_priority = config.max_priority,
            ack_timeout_secs = config.ack_timeout.as_secs(),
            "Declared durable channel"
        );
        Self {
            pool,
            config: Arc::new(config),
            notify: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Messages waiting for delivery, including expired leases.
    pub async fn depth(&self) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT count(*) FROM job_messages
             WHERE queue = $1 AND NOT dead
               AND (locked_until IS NULL OR locked_until < now())",
        )
        .bind(&self.config.name)
        .fetch_one(&self.pool)
        .await
        .map_err(queue_err)
    }

    /// Messages discarded by a non-requeueing nack, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadMessage>> {
        let rows = sqlx::query(
            "SELECT id, body, priority, delivery_count FROM job_messages
             WHERE queue = $1 AND dead
             ORDER BY id ASC",
        )
        .bind(&self.config.name)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_err)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let priority: i16 = row.get("priority");
                DeadMessage {
                    id: row.get("id"),
                    body: row.get("body"),
                    priority: u8::try_from(priority).unwrap_or(0),
                    deliveries: row.get("delivery_count"),
                }
            })
            .collect())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Queue(format!("channel {} is closed", self.config.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl PriorityChannel for PgChannel {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn max_priority(&self) -> u8 {
        self.config.max_priority
    }

    async fn publish(&self, body: &[u8], priority: u8) -> Result<bool> {
        self.ensure_open()?;
        let priority = self.config.clamp_priority(priority);

        // The count runs on the pre-insert snapshot.
        let ready: i64 = sqlx::query_scalar(
            "WITH inserted AS (
                 INSERT INTO job_messages (queue, body, priority) VALUES ($1, $2, $3)
                 RETURNING id
             )
             SELECT count(*) FROM job_messages
             WHERE queue = $1 AND NOT dead AND locked_until IS NULL",
        )
        .bind(&self.config.name)
        .bind(body)
        .bind(i16::from(priority))
        .fetch_one(&self.pool)
        .await
        .map_err(queue_err)?;

        self.notify.notify_waiters();
        Ok(usize::try_from(ready).unwrap_or(usize::MAX) < self.config.capacity)
    }

    async fn subscribe(&self, prefetch: usize) -> Result<Box<dyn Subscription>> {
        if prefetch == 0 {
            return Err(Error::Validation("prefetch must be at least 1".to_string()));
        }
        self.ensure_open()?;

        let consumer_id = Uuid::new_v4();
        debug!(queue = %self.config.name, %consumer_id, prefetch, "Opened subscription");
        Ok(Box::new(PgSubscription {
            channel: self.clone(),
            consumer_id,
            prefetch,
            held: HashSet::new(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        info!(queue = %self.config.name, "Channel closed");
        Ok(())
    }
}

/// Subscription on a [`PgChannel`].
pub struct PgSubscription {
    channel: PgChannel,
    consumer_id: Uuid,
    prefetch: usize,
    held: HashSet<DeliveryTag>,
}

impl PgSubscription {
    async fn claim(&self) -> Result<Option<Delivery>> {
        let start = Instant::now();
        let row = sqlx::query(
            "UPDATE job_messages
             SET locked_until = now() + make_interval(secs => $2),
                 consumer_id = $3,
                 delivery_count = delivery_count + 1
             WHERE id = (
                 SELECT id FROM job_messages
                 WHERE queue = $1 AND NOT dead
                   AND (locked_until IS NULL OR locked_until < now())
                 ORDER BY priority DESC, position ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, body, priority, delivery_count",
        )
        .bind(&self.channel.config.name)
        .bind(self.channel.config.ack_timeout.as_secs_f64())
        .bind(self.consumer_id)
        .fetch_optional(&self.channel.pool)
        .await
        .map_err(queue_err)?;

        Ok(row.map(|row| {
            let id: i64 = row.get("id");
            let priority: i16 = row.get("priority");
            let deliveries: i32 = row.get("delivery_count");
            debug!(
                queue = %self.channel.config.name,
                delivery_tag = id,
                deliveries,
                duration_ms = start.elapsed().as_millis() as u64,
                "Claimed message"
            );
            Delivery {
                tag: id as DeliveryTag,
                body: row.get("body"),
                priority: u8::try_from(priority).unwrap_or(0),
                redelivered: deliveries > 1,
            }
        }))
    }

    fn release(&mut self, tag: DeliveryTag) -> Result<i64> {
        if !self.held.remove(&tag) {
            return Err(Error::Queue(format!("unknown delivery tag {tag}")));
        }
        i64::try_from(tag).map_err(|_| Error::Queue(format!("invalid delivery tag {tag}")))
    }
}

#[async_trait]
impl Subscription for PgSubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let notify = self.channel.notify.clone();
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.channel.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if self.held.len() >= self.prefetch {
                return Err(Error::Queue(format!(
                    "prefetch limit of {} unacknowledged deliveries reached",
                    self.prefetch
                )));
            }

            if let Some(delivery) = self.claim().await? {
                self.held.insert(delivery.tag);
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.channel.config.poll_interval) => {}
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        let id = self.release(tag)?;
        let done = sqlx::query("DELETE FROM job_messages WHERE id = $1 AND consumer_id = $2")
            .bind(id)
            .bind(self.consumer_id)
            .execute(&self.channel.pool)
            .await
            .map_err(queue_err)?;

        if done.rows_affected() == 0 {
            // Lease expired and another consumer claimed the message.
            warn!(delivery_tag = id, "Ack after lease expiry; message will be redelivered");
        }
        Ok(())
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let id = self.release(tag)?;
        let sql = if requeue {
            "UPDATE job_messages
             SET locked_until = NULL, consumer_id = NULL,
                 position = nextval('job_messages_position_seq')
             WHERE id = $1 AND consumer_id = $2"
        } else {
            "UPDATE job_messages SET dead = TRUE, locked_until = NULL, consumer_id = NULL
             WHERE id = $1 AND consumer_id = $2"
        };
        sqlx::query(sql)
            .bind(id)
            .bind(self.consumer_id)
            .execute(&self.channel.pool)
            .await
            .map_err(queue_err)?;

        if requeue {
            self.channel.notify.notify_waiters();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE job_messages SET locked_until = NULL, consumer_id = NULL
             WHERE consumer_id = $1 AND NOT dead",
        )
        .bind(self.consumer_id)
        .execute(&self.channel.pool)
        .await
        .map_err(queue_err)?;
        self.held.clear();
        self.channel.notify.notify_waiters();
        Ok(())
    }
}
