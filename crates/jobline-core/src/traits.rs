//! Core traits for jobline abstractions.
//!
//! These traits define the seams between the pipeline and its collaborators
//! (the job store, the priority channel, the remote completion service), so
//! each can be swapped for an in-process implementation in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{CallError, Result};
use crate::lifecycle::StatusChange;
use crate::models::*;

// =============================================================================
// JOB STORE
// =============================================================================

/// Durable, transactional record of jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a job at QUEUED. Fails with `Validation` when the input is absent.
    async fn create(&self, req: CreateJobRequest) -> Result<Job>;

    /// Get a job by id. Fails with `NotFound` when absent.
    async fn get(&self, id: i64) -> Result<Job>;

    /// Jobs of one owner, newest first.
    async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Job>>;

    /// Transactionally validate and apply a status change.
    ///
    /// Concurrent callers racing on the same transition serialize on the
    /// store; exactly one wins and the rest observe `Business`.
    async fn update_status(&self, id: i64, change: StatusChange) -> Result<Job>;

    /// Highest-priority QUEUED job, oldest first within a priority.
    async fn next_queued(&self) -> Result<Option<Job>>;

    /// Record that the job's envelope was published at `at`.
    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// QUEUED jobs not published since `older_than`, least recently
    /// published first. A job never published counts from its creation.
    async fn list_stale_queued(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// Apply a status patch whose status is still an unparsed string.
    ///
    /// The job is looked up first so an unknown id reports `NotFound` before
    /// an unknown status reports `Validation`.
    async fn apply_status_request(&self, id: i64, req: UpdateJobStatusRequest) -> Result<Job> {
        self.get(id).await?;
        let status: JobStatus = req.status.parse()?;
        self.update_status(
            id,
            StatusChange {
                status,
                result: req.result,
                error_message: req.error_message,
            },
        )
        .await
    }
}

// =============================================================================
// PRIORITY CHANNEL
// =============================================================================

/// Durable, priority-ordered, at-least-once delivery channel.
///
/// The channel carries opaque bodies; it never interprets the payload.
#[async_trait]
pub trait PriorityChannel: Send + Sync {
    /// Queue name, for logs.
    fn name(&self) -> &str;

    /// Highest priority level the channel distinguishes.
    fn max_priority(&self) -> u8;

    /// Persist a message with a scheduling priority.
    ///
    /// `Ok(false)` means the message was accepted but the channel is
    /// saturated and delivery may be delayed. It is not a failure.
    async fn publish(&self, body: &[u8], priority: u8) -> Result<bool>;

    /// Open a subscription holding at most `prefetch` unacknowledged deliveries.
    async fn subscribe(&self, prefetch: usize) -> Result<Box<dyn Subscription>>;

    /// Stop handing out deliveries. Pending subscriptions see end of stream.
    async fn close(&self) -> Result<()>;
}

/// A consumer's view of a [`PriorityChannel`].
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery; `None` once the channel is closed.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Permanently remove a delivered message.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<()>;

    /// Return a delivered message for redelivery behind the other messages
    /// of its priority, or dead-letter it.
    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Release the subscription. Unacknowledged deliveries are requeued.
    async fn close(&mut self) -> Result<()>;
}

// =============================================================================
// REMOTE COMPLETION SERVICE
// =============================================================================

/// Backend for chat-style completions.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Make one attempt at a completion.
    ///
    /// The response is validated against the completion contract; a
    /// missing field yields [`CallError::InvalidResponse`].
    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, CallError>;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}
