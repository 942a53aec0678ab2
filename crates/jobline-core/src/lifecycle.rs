//! Job lifecycle state machine.
//!
//! ```text
//! QUEUED ──► PROCESSING ──► COMPLETED
//!                      └──► FAILED
//! ```
//!
//! Both stores route every status mutation through [`plan_update`], so the
//! transition table lives in exactly one place.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::models::{Job, JobStatus};

/// Outcome of checking a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Write the new status.
    Apply,
    /// Target equals the current terminal state; nothing to write.
    Unchanged,
}

/// Check `current -> target` against the transition table.
pub fn check_transition(current: JobStatus, target: JobStatus) -> Result<Transition> {
    use JobStatus::*;

    if current.is_terminal() {
        if current == target {
            return Ok(Transition::Unchanged);
        }
        return Err(Error::Business(format!(
            "job is already {current}; cannot move to {target}"
        )));
    }

    match (current, target) {
        (Queued, Processing) | (Processing, Completed) | (Processing, Failed) => {
            Ok(Transition::Apply)
        }
        _ => Err(Error::Business(format!(
            "illegal status transition {current} -> {target}"
        ))),
    }
}

/// Requested status change with its optional payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: JobStatus,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
}

impl StatusChange {
    pub fn processing() -> Self {
        Self {
            status: JobStatus::Processing,
            result: None,
            error_message: None,
        }
    }

    pub fn completed(result: JsonValue) -> Self {
        Self {
            status: JobStatus::Completed,
            result: Some(result),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: None,
            error_message: Some(message.into()),
        }
    }
}

/// Compute the record that results from applying `change` to `job` at `now`.
///
/// Returns `Ok(None)` for an idempotent re-application of the current
/// terminal state; the stored record must then be left untouched.
pub fn plan_update(job: &Job, change: StatusChange, now: DateTime<Utc>) -> Result<Option<Job>> {
    if check_transition(job.status, change.status)? == Transition::Unchanged {
        return Ok(None);
    }

    let mut next = job.clone();
    next.status = change.status;
    next.updated_at = now;

    match change.status {
        JobStatus::Processing => {
            next.started_at = Some(now);
            next.result = None;
            next.error_message = None;
        }
        JobStatus::Completed => {
            let result = change
                .result
                .filter(|r| !r.is_null())
                .ok_or_else(|| Error::Validation("COMPLETED requires a result".to_string()))?;
            next.result = Some(result);
            next.error_message = None;
            next.completed_at = Some(now);
        }
        JobStatus::Failed => {
            let message = change
                .error_message
                .filter(|m| !m.trim().is_empty())
                .ok_or_else(|| {
                    Error::Validation("FAILED requires an error message".to_string())
                })?;
            next.result = None;
            next.error_message = Some(message);
            next.completed_at = Some(now);
        }
        // check_transition never yields Apply for a QUEUED target
        JobStatus::Queued => {
            return Err(Error::Internal("transition into QUEUED".to_string()));
        }
    }

    Ok(Some(next))
}
