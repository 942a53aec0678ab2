//! Bounded, fixed-delay retry around a single unit of remote work.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use jobline_core::defaults::{JOB_MAX_RETRIES, JOB_RETRY_DELAY_MS, JOB_TIMEOUT_SECS};
use jobline_core::{CallError, JobError};

/// Retry limits for one job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
    /// Deadline for each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: JOB_MAX_RETRIES,
            retry_delay: Duration::from_millis(JOB_RETRY_DELAY_MS),
            attempt_timeout: Duration::from_secs(JOB_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Create a policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_MAX_RETRIES` | `3` | Retries after the first attempt |
    /// | `JOB_RETRY_DELAY_MS` | `1000` | Pause between attempts |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-attempt deadline |
    pub fn from_env() -> Self {
        let max_retries = std::env::var("JOB_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(JOB_MAX_RETRIES);

        let retry_delay_ms = std::env::var("JOB_RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(JOB_RETRY_DELAY_MS);

        let timeout_secs = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(JOB_TIMEOUT_SECS);

        Self {
            max_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
            attempt_timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Runs work under a [`RetryPolicy`].
///
/// Each attempt is bounded by the policy's deadline; a missed deadline
/// counts as a [`CallError::TimedOut`] failure. Failures that cannot change
/// on a retry (invalid response, invalid input) end the run immediately.
#[derive(Debug, Clone, Default)]
pub struct ExecutionWrapper {
    policy: RetryPolicy,
}

impl ExecutionWrapper {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `work` until it succeeds or the attempt budget is spent.
    ///
    /// `work` receives the 1-based attempt number. On exhaustion the last
    /// failure is classified into a [`JobError`].
    pub async fn run<T, F, Fut>(&self, job_id: i64, mut work: F) -> Result<T, JobError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(job_id, attempt, max_attempts, "Starting attempt");

            let outcome = match timeout(self.policy.attempt_timeout, work(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CallError::TimedOut(format!(
                    "attempt exceeded {}s deadline",
                    self.policy.attempt_timeout.as_secs()
                ))),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(job_id, attempt, "Job succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(job_id, attempt, error = %err, "Non-retryable failure");
                return Err(JobError::exhausted(job_id, attempt, err));
            }

            if attempt >= max_attempts {
                warn!(job_id, attempts = attempt, error = %err, "Retries exhausted");
                return Err(JobError::exhausted(job_id, attempt, err));
            }

            warn!(
                job_id,
                attempt,
                max_attempts,
                retry_in_ms = self.policy.retry_delay.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            sleep(self.policy.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_core::JobFailure;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_retry_delay(Duration::from_millis(1000))
            .with_attempt_timeout(Duration::from_secs(300))
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.retry_delay, Duration::from_millis(1000));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_try() {
        let wrapper = ExecutionWrapper::new(fast_policy());
        let calls = AtomicU32::new(0);

        let value = wrapper
            .run(1, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CallError>(7) }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let wrapper = ExecutionWrapper::new(fast_policy());
        let start = Instant::now();

        let value = wrapper
            .run(1, |attempt| async move {
                if attempt < 3 {
                    Err(CallError::Status {
                        status: 503,
                        body: "busy".into(),
                    })
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_four_attempts() {
        let wrapper = ExecutionWrapper::new(fast_policy());
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let err = wrapper
            .run(9, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CallError::Unreachable("refused".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.job_id, 9);
        assert_eq!(err.failure, JobFailure::Unreachable);
        assert_eq!(err.message, "LLM service unreachable");
        // Three pauses between four attempts.
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_deadline_counts_as_timeout() {
        let policy = fast_policy().with_attempt_timeout(Duration::from_secs(5));
        let wrapper = ExecutionWrapper::new(policy);
        let start = Instant::now();

        let err = wrapper
            .run(2, |_| std::future::pending::<Result<(), CallError>>())
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 4);
        assert_eq!(err.failure, JobFailure::TimedOut);
        assert_eq!(err.message, "LLM request timed out");
        assert!(start.elapsed() >= Duration::from_secs(4 * 5 + 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_response_not_retried() {
        let wrapper = ExecutionWrapper::new(fast_policy());
        let calls = AtomicU32::new(0);

        let err = wrapper
            .run(3, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CallError::InvalidResponse("no choices".into())) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert_eq!(err.failure, JobFailure::InvalidResponse);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let wrapper = ExecutionWrapper::new(fast_policy().with_max_retries(0));
        let calls = AtomicU32::new(0);

        let err = wrapper
            .run(4, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(CallError::Status {
                        status: 500,
                        body: "boom".into(),
                    })
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.message, "LLM API error: 500");
    }
}
