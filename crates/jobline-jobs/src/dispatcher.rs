//! Job creation and publication.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use jobline_core::defaults::JOB_RECONCILE_BATCH;
use jobline_core::{CreateJobRequest, Error, Job, JobStore, PriorityChannel, Result};

/// Outcome of a stale-job sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale QUEUED jobs found.
    pub scanned: usize,
    /// Jobs published again.
    pub republished: usize,
    /// Jobs whose publish failed; they stay QUEUED for the next sweep.
    pub failed: usize,
}

/// Persists jobs and publishes them to the priority channel.
///
/// The job row is committed before its envelope is published. If the publish
/// fails the job is left QUEUED without a message; [`Dispatcher::reconcile_stale`]
/// publishes such jobs again.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    channel: Arc<dyn PriorityChannel>,
    reconcile_batch: i64,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, channel: Arc<dyn PriorityChannel>) -> Self {
        Self {
            store,
            channel,
            reconcile_batch: JOB_RECONCILE_BATCH,
        }
    }

    /// Maximum jobs republished per sweep.
    pub fn with_reconcile_batch(mut self, batch: i64) -> Self {
        self.reconcile_batch = batch.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn channel(&self) -> &Arc<dyn PriorityChannel> {
        &self.channel
    }

    /// Create a job and enqueue it.
    ///
    /// Validation failures are returned before anything is written. A
    /// publish failure after the insert is returned as a queue error; the
    /// job itself exists and is QUEUED.
    #[instrument(skip(self, req), fields(owner_id = %req.owner_id))]
    pub async fn create_job(&self, req: CreateJobRequest) -> Result<Job> {
        let job = self.store.create(req).await?;

        if let Err(e) = self.publish(&job).await {
            error!(
                job_id = job.id,
                queue = self.channel.name(),
                error = %e,
                "Job persisted but not enqueued; reconciliation will republish it"
            );
            return Err(e);
        }

        Ok(job)
    }

    /// Publish a job's envelope at its priority.
    ///
    /// Returns the channel's backpressure signal: `false` means the message
    /// was accepted but delivery may be delayed. The publish time is recorded
    /// on the job so the stale sweep leaves it alone for a while.
    pub async fn publish(&self, job: &Job) -> Result<bool> {
        let body = job.envelope().to_bytes()?;
        let priority = channel_priority(job.priority, self.channel.max_priority());

        let accepted = self.channel.publish(&body, priority).await?;
        if let Err(e) = self.store.mark_published(job.id, Utc::now()).await {
            // The message is out; at worst the sweep publishes it once more.
            warn!(job_id = job.id, error = %e, "Failed to record publish time");
        }
        if accepted {
            info!(
                subsystem = "jobs",
                op = "publish",
                job_id = job.id,
                priority,
                queue = self.channel.name(),
                "Job enqueued"
            );
        } else {
            warn!(
                subsystem = "jobs",
                op = "publish",
                job_id = job.id,
                priority,
                queue = self.channel.name(),
                "Channel saturated; job enqueued but delivery may be delayed"
            );
        }
        Ok(accepted)
    }

    /// Republish QUEUED jobs not published within `stale_after`.
    ///
    /// A job still waiting behind a backlog is republished at most once per
    /// `stale_after`. Consumers drop the extra delivery once the job has left
    /// QUEUED.
    pub async fn reconcile_stale(&self, stale_after: Duration) -> Result<ReconcileReport> {
        let age = chrono::Duration::from_std(stale_after)
            .map_err(|e| Error::Config(format!("stale age out of range: {e}")))?;
        let cutoff = Utc::now() - age;

        let stale = self
            .store
            .list_stale_queued(cutoff, self.reconcile_batch)
            .await?;

        let mut report = ReconcileReport {
            scanned: stale.len(),
            ..Default::default()
        };

        for job in &stale {
            match self.publish(job).await {
                Ok(_) => report.republished += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(job_id = job.id, error = %e, "Failed to republish stale job");
                }
            }
        }

        if report.scanned > 0 {
            info!(
                subsystem = "jobs",
                op = "reconcile",
                scanned = report.scanned,
                republished = report.republished,
                failed = report.failed,
                "Stale job sweep finished"
            );
        }

        Ok(report)
    }
}

/// Map a stored job priority onto the channel's `0..=max` range.
pub fn channel_priority(priority: i32, max_priority: u8) -> u8 {
    priority.clamp(0, i32::from(max_priority)) as u8
}
