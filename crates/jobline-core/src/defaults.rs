//! Centralized default constants for jobline.
//!
//! **This module is the single source of truth** for shared default values.
//! Config constructors fall back to these when an environment variable is
//! unset.

// =============================================================================
// EXECUTION
// =============================================================================

/// Retries after the first attempt (4 attempts total).
pub const JOB_MAX_RETRIES: u32 = 3;

/// Fixed delay between attempts, in milliseconds.
pub const JOB_RETRY_DELAY_MS: u64 = 1000;

/// Hard deadline for a single attempt, in seconds.
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// QUEUED jobs older than this are considered orphaned by the sweep.
pub const JOB_STALE_AFTER_SECS: u64 = 600;

/// Upper bound on jobs republished per reconciliation pass.
pub const JOB_RECONCILE_BATCH: i64 = 100;

/// Seconds between reconciliation passes in the worker; 0 disables them.
pub const JOB_RECONCILE_INTERVAL_SECS: u64 = 60;

// =============================================================================
// QUEUE
// =============================================================================

pub const QUEUE_NAME: &str = "job_queue";

/// Discrete priority levels the channel distinguishes (0..=10).
pub const QUEUE_MAX_PRIORITY: u8 = 10;

/// Ready messages held before publish reports backpressure.
pub const QUEUE_CAPACITY: usize = 10_000;

/// Poll interval for the database-backed channel, in milliseconds.
pub const QUEUE_POLL_INTERVAL_MS: u64 = 500;

/// Lease on an unacknowledged delivery before it is redelivered, in seconds.
///
/// Must exceed the worst-case execution budget (4 x 300 s + 3 x 1 s).
pub const QUEUE_ACK_TIMEOUT_SECS: u64 = 1800;

/// Unacknowledged deliveries a consumer may hold.
pub const CONSUMER_PREFETCH: usize = 1;

/// Capacity of the consumer event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// DATABASE
// =============================================================================

/// Maximum pool connections.
pub const DB_MAX_CONNECTIONS: u32 = 10;

/// Wait for a free pool connection, in seconds.
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Lock wait bound inside a status-update transaction, in milliseconds.
pub const DB_TRANSACTION_TIMEOUT_MS: u64 = 5000;

// =============================================================================
// LLM
// =============================================================================

pub const LLM_API_URL: &str = "http://localhost:8000/v1";

pub const LLM_MODEL: &str = "gpt-3.5-turbo";

pub const LLM_MAX_TOKENS: u32 = 1024;

pub const LLM_TEMPERATURE: f32 = 0.7;

/// Client-side HTTP timeout, in seconds. Longer than the attempt deadline so
/// the execution wrapper's deadline fires first.
pub const LLM_REQUEST_TIMEOUT_SECS: u64 = 540;

pub const LLM_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
