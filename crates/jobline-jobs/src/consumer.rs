//! Queue consumer that drives jobs through their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use jobline_core::defaults::{CONSUMER_PREFETCH, EVENT_BUS_CAPACITY, QUEUE_POLL_INTERVAL_MS};
use jobline_core::{
    Delivery, DeliveryTag, Error, Job, JobEnvelope, JobError, JobStatus, JobStore, PriorityChannel,
    Result, StatusChange, Subscription,
};

use crate::handler::JobHandler;
use crate::retry::{ExecutionWrapper, RetryPolicy};

/// Configuration for the job consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries held at once.
    pub prefetch: usize,
    /// Whether to consume at all.
    pub enabled: bool,
    /// Pause after a store or channel error.
    pub error_backoff: Duration,
    /// Retry limits for each job.
    pub retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: CONSUMER_PREFETCH,
            enabled: true,
            error_backoff: Duration::from_millis(QUEUE_POLL_INTERVAL_MS),
            retry: RetryPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable consumption |
    /// | `CONSUMER_PREFETCH` | `1` | Unacknowledged deliveries held at once |
    /// | `QUEUE_POLL_INTERVAL_MS` | `500` | Backoff after a store or channel error |
    ///
    /// Retry limits come from [`RetryPolicy::from_env`].
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let prefetch = std::env::var("CONSUMER_PREFETCH")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(CONSUMER_PREFETCH)
            .max(1);

        let backoff_ms = std::env::var("QUEUE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(QUEUE_POLL_INTERVAL_MS);

        Self {
            prefetch,
            enabled,
            error_backoff: Duration::from_millis(backoff_ms),
            retry: RetryPolicy::from_env(),
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Why a delivery was acknowledged without running its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The job id is not in the store.
    NotFound,
    /// The job was already COMPLETED or FAILED.
    AlreadyTerminal,
    /// Another consumer owns the job or recorded its outcome first.
    LostRace,
}

/// Event emitted by the job consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    /// Consumer subscribed and is waiting for deliveries.
    ConsumerStarted,
    /// A job moved to PROCESSING and its work began.
    JobStarted { job_id: i64 },
    /// A job was written COMPLETED.
    JobCompleted { job_id: i64 },
    /// A job was written FAILED.
    JobFailed {
        job_id: i64,
        code: &'static str,
        error: String,
    },
    /// A delivery was acknowledged without running its job.
    DeliverySkipped { job_id: i64, reason: SkipReason },
    /// A delivery was returned to the channel.
    DeliveryRequeued { job_id: Option<i64>, reason: String },
    /// Consumer stopped.
    ConsumerStopped,
}

/// What the consumer did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Completed,
    Failed,
    Skipped(SkipReason),
    Requeued,
}

/// Handle for controlling a running consumer.
pub struct ConsumerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<ConsumerEvent>,
    join: JoinHandle<Result<()>>,
}

impl ConsumerHandle {
    /// Signal the consumer to stop and wait for it.
    ///
    /// A delivery already being processed is finished, and acknowledged or
    /// returned, before the subscription is closed.
    pub async fn shutdown(self) -> Result<()> {
        // The loop may already be gone (channel closed); joining reports why.
        let _ = self.shutdown_tx.send(()).await;
        self.join
            .await
            .map_err(|e| Error::Internal(format!("consumer task failed: {e}")))?
    }

    /// Get a receiver for consumer events.
    pub fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.event_rx.resubscribe()
    }

    /// Whether the consumer loop has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Consumes job envelopes from a priority channel.
///
/// For each delivery the job is re-read from the store, which is the source
/// of truth; the envelope only names the job. Jobs that are missing or
/// already terminal are acknowledged and skipped, so duplicate deliveries
/// never produce a second terminal write. A job found in PROCESSING is only
/// resumed from a redelivery; a first delivery means another consumer holds
/// the job.
pub struct JobConsumer {
    store: Arc<dyn JobStore>,
    channel: Arc<dyn PriorityChannel>,
    handler: Arc<dyn JobHandler>,
    wrapper: ExecutionWrapper,
    config: ConsumerConfig,
    event_tx: broadcast::Sender<ConsumerEvent>,
}

impl JobConsumer {
    pub fn new(
        store: Arc<dyn JobStore>,
        channel: Arc<dyn PriorityChannel>,
        handler: Arc<dyn JobHandler>,
        config: ConsumerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            store,
            channel,
            handler,
            wrapper: ExecutionWrapper::new(config.retry.clone()),
            config,
            event_tx,
        }
    }

    /// Get a receiver for consumer events.
    pub fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the consumer and return a handle for control.
    pub fn start(self) -> ConsumerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let join = tokio::spawn(async move { self.run(&mut shutdown_rx).await });

        ConsumerHandle {
            shutdown_tx,
            event_rx,
            join,
        }
    }

    /// Run the consume loop until shutdown or until the channel closes.
    #[instrument(skip(self, shutdown_rx), fields(queue = self.channel.name(), handler = self.handler.name()))]
    pub async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        if !self.config.enabled {
            info!("Job consumer is disabled, not starting");
            return Ok(());
        }

        let mut sub = self.channel.subscribe(self.config.prefetch).await?;

        info!(
            prefetch = self.config.prefetch,
            max_retries = self.config.retry.max_retries,
            "Job consumer started"
        );
        let _ = self.event_tx.send(ConsumerEvent::ConsumerStarted);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Job consumer received shutdown signal");
                    break;
                }
                next = sub.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    self.process_delivery(sub.as_mut(), delivery).await;
                }
                Ok(None) => {
                    info!("Channel closed, stopping consumer");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive delivery");
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("Job consumer received shutdown signal");
                            break;
                        }
                        _ = sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        if let Err(e) = sub.close().await {
            warn!(error = %e, "Failed to close subscription");
        }

        let _ = self.event_tx.send(ConsumerEvent::ConsumerStopped);
        info!("Job consumer stopped");
        Ok(())
    }

    /// Handle one delivery, ending in exactly one ack or nack.
    pub async fn process_delivery(
        &self,
        sub: &mut dyn Subscription,
        delivery: Delivery,
    ) -> DeliveryOutcome {
        let tag = delivery.tag;

        let envelope = match JobEnvelope::from_bytes(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(delivery_tag = tag, error = %e, "Undecodable job envelope, requeueing");
                return self.requeue(sub, tag, None, e.to_string()).await;
            }
        };
        let job_id = envelope.id;

        debug!(
            job_id,
            delivery_tag = tag,
            redelivered = delivery.redelivered,
            "Received delivery"
        );

        let job = match self.store.get(job_id).await {
            Ok(job) => job,
            Err(Error::NotFound(_)) => {
                warn!(job_id, "Delivery for unknown job, dropping");
                return self.skip(sub, tag, job_id, SkipReason::NotFound).await;
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to load job");
                return self.requeue(sub, tag, Some(job_id), e.to_string()).await;
            }
        };

        let job = match job.status {
            JobStatus::Completed | JobStatus::Failed => {
                debug!(job_id, status = %job.status, "Job already finished, dropping delivery");
                return self.skip(sub, tag, job_id, SkipReason::AlreadyTerminal).await;
            }
            JobStatus::Processing if delivery.redelivered => {
                // The previous holder of this message died mid-job.
                info!(job_id, "Resuming job left in PROCESSING");
                job
            }
            JobStatus::Processing => {
                debug!(job_id, "Job is being processed elsewhere, dropping duplicate delivery");
                return self.skip(sub, tag, job_id, SkipReason::LostRace).await;
            }
            JobStatus::Queued => match self.store.update_status(job_id, StatusChange::processing()).await {
                Ok(job) => job,
                Err(Error::Business(reason)) => {
                    debug!(job_id, %reason, "Another consumer took the job");
                    return self.skip(sub, tag, job_id, SkipReason::LostRace).await;
                }
                Err(e) => {
                    error!(job_id, error = %e, "Failed to mark job PROCESSING");
                    return self.requeue(sub, tag, Some(job_id), e.to_string()).await;
                }
            },
        };

        info!(
            subsystem = "jobs",
            op = "execute",
            job_id,
            owner_id = %job.owner_id,
            priority = job.priority,
            "Processing job"
        );
        let _ = self.event_tx.send(ConsumerEvent::JobStarted { job_id });

        let (change, failure) = match self.execute(&job).await {
            Ok(result) => (StatusChange::completed(result), None),
            Err(err) => {
                error!(
                    job_id,
                    attempts = err.attempts,
                    code = err.code(),
                    error = %err,
                    "Job failed"
                );
                (StatusChange::failed(err.record_message()), Some(err))
            }
        };

        // Stores keep microseconds.
        let issued_at = Utc::now().trunc_subsecs(6);
        let written = change.clone();

        match self.store.update_status(job_id, change).await {
            Ok(job) if !holds_outcome(&job, &written, issued_at) => {
                warn!(
                    job_id,
                    status = %job.status,
                    "Job already finished by another consumer, outcome discarded"
                );
                self.skip(sub, tag, job_id, SkipReason::LostRace).await
            }
            Ok(job) => {
                self.ack(sub, tag, job_id).await;
                match failure {
                    None => {
                        info!(job_id, status = %job.status, "Job completed");
                        let _ = self.event_tx.send(ConsumerEvent::JobCompleted { job_id });
                        DeliveryOutcome::Completed
                    }
                    Some(err) => {
                        let _ = self.event_tx.send(ConsumerEvent::JobFailed {
                            job_id,
                            code: err.code(),
                            error: err.record_message(),
                        });
                        DeliveryOutcome::Failed
                    }
                }
            }
            Err(Error::Business(reason)) => {
                warn!(job_id, %reason, "Terminal write rejected, another consumer finished the job");
                self.skip(sub, tag, job_id, SkipReason::LostRace).await
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to record job outcome");
                self.requeue(sub, tag, Some(job_id), e.to_string()).await
            }
        }
    }

    async fn execute(&self, job: &Job) -> std::result::Result<JsonValue, JobError> {
        let handler: &dyn JobHandler = self.handler.as_ref();
        self.wrapper
            .run(job.id, move |_attempt| handler.execute(job))
            .await
    }

    async fn ack(&self, sub: &mut dyn Subscription, tag: DeliveryTag, job_id: i64) {
        // A lost ack only means a redelivery, which the status check absorbs.
        if let Err(e) = sub.ack(tag).await {
            warn!(job_id, delivery_tag = tag, error = %e, "Failed to acknowledge delivery");
        }
    }

    async fn skip(
        &self,
        sub: &mut dyn Subscription,
        tag: DeliveryTag,
        job_id: i64,
        reason: SkipReason,
    ) -> DeliveryOutcome {
        self.ack(sub, tag, job_id).await;
        let _ = self
            .event_tx
            .send(ConsumerEvent::DeliverySkipped { job_id, reason });
        DeliveryOutcome::Skipped(reason)
    }

    async fn requeue(
        &self,
        sub: &mut dyn Subscription,
        tag: DeliveryTag,
        job_id: Option<i64>,
        reason: String,
    ) -> DeliveryOutcome {
        if let Err(e) = sub.nack(tag, true).await {
            warn!(?job_id, delivery_tag = tag, error = %e, "Failed to requeue delivery");
        }
        let _ = self
            .event_tx
            .send(ConsumerEvent::DeliveryRequeued { job_id, reason });
        sleep(self.config.error_backoff).await;
        DeliveryOutcome::Requeued
    }
}

/// Whether `job` carries the outcome of `change` written at or after
/// `issued_at`, rather than an equal terminal state recorded earlier.
fn holds_outcome(job: &Job, change: &StatusChange, issued_at: DateTime<Utc>) -> bool {
    job.status == change.status
        && job.result == change.result
        && job.error_message == change.error_message
        && job.completed_at.is_some_and(|at| at >= issued_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn finished(change: &StatusChange, completed_at: DateTime<Utc>) -> Job {
        Job {
            id: 1,
            owner_id: "42".into(),
            input: json!({"prompt": "hi"}),
            priority: 0,
            status: change.status,
            result: change.result.clone(),
            error_message: change.error_message.clone(),
            created_at: completed_at,
            updated_at: completed_at,
            started_at: Some(completed_at),
            completed_at: Some(completed_at),
            published_at: None,
        }
    }

    #[test]
    fn test_holds_outcome() {
        let issued_at = Utc::now();
        let ours = StatusChange::completed(json!({"content": "mine"}));

        assert!(holds_outcome(&finished(&ours, issued_at), &ours, issued_at));

        let theirs = StatusChange::completed(json!({"content": "theirs"}));
        assert!(!holds_outcome(&finished(&theirs, issued_at), &ours, issued_at));

        let earlier = issued_at - chrono::Duration::seconds(5);
        assert!(!holds_outcome(&finished(&ours, earlier), &ours, issued_at));
    }

    #[test]
    fn test_config_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.prefetch, 1);
        assert!(config.enabled);
        assert_eq!(config.error_backoff, Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts(), 4);
    }

    #[test]
    fn test_prefetch_floor() {
        let config = ConsumerConfig::default().with_prefetch(0);
        assert_eq!(config.prefetch, 1);
    }
}
