//! Domain models for jobline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

// =============================================================================
// JOB
// =============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Database / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// COMPLETED and FAILED accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(Error::Validation(format!("invalid job status: {other}"))),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub owner_id: String,
    pub input: JsonValue,
    pub priority: i32,
    pub status: JobStatus,
    /// Present only when COMPLETED.
    pub result: Option<JsonValue>,
    /// Present only when FAILED.
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on entry to PROCESSING.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on entry to COMPLETED or FAILED.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last time the job's envelope was handed to the channel.
    pub published_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Snapshot of this job for the priority channel.
    pub fn envelope(&self) -> JobEnvelope {
        JobEnvelope {
            id: self.id,
            owner_id: self.owner_id.clone(),
            priority: self.priority,
            input: self.input.clone(),
        }
    }
}

/// Request to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub owner_id: String,
    /// Required; a missing or null payload is rejected.
    #[serde(default)]
    pub input: Option<JsonValue>,
    #[serde(default)]
    pub priority: i32,
}

impl CreateJobRequest {
    pub fn new(owner_id: impl Into<String>, input: JsonValue, priority: i32) -> Self {
        Self {
            owner_id: owner_id.into(),
            input: Some(input),
            priority,
        }
    }

    /// Check the request and return the input payload.
    pub fn validate(&self) -> Result<&JsonValue> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::Validation("owner id is required".to_string()));
        }
        match &self.input {
            Some(input) if !input.is_null() => Ok(input),
            _ => Err(Error::Validation("input payload is required".to_string())),
        }
    }
}

/// Status patch as received from the external API surface.
///
/// `status` is kept as a string so an unrecognized value surfaces as a
/// validation error at the store boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJobStatusRequest {
    pub status: String,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub error_message: Option<String>,
}

// =============================================================================
// QUEUE MESSAGES
// =============================================================================

/// Message body published to the priority channel.
///
/// A best-effort snapshot of the job at publish time; consumers re-read the
/// store before acting on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: i64,
    pub owner_id: String,
    pub priority: i32,
    pub input: JsonValue,
}

impl JobEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Channel-assigned identifier of one delivery.
pub type DeliveryTag = u64;

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    /// Raw body; decoding is the consumer's job.
    pub body: Vec<u8>,
    /// Scheduling priority the message was published with.
    pub priority: u8,
    /// Whether this message was delivered before.
    pub redelivered: bool,
}

// =============================================================================
// COMPLETION CONTRACT
// =============================================================================

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request to the remote completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub priority: i32,
    /// Caller identity forwarded to the service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Token accounting reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A validated completion, stored as the job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: Option<String>,
    pub model: Option<String>,
    pub created: Option<i64>,
    pub content: String,
    pub finish_reason: String,
    pub usage: Usage,
}

impl Completion {
    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip_strings() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_status_is_validation_error() {
        let err = "BOGUS".parse::<JobStatus>().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("BOGUS"));
    }

    #[test]
    fn test_status_is_case_sensitive() {
        assert!("queued".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_serde_uppercase() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
    }

    #[test]
    fn test_create_request_requires_input() {
        let req = CreateJobRequest {
            owner_id: "42".into(),
            input: None,
            priority: 0,
        };
        assert!(matches!(req.validate(), Err(Error::Validation(_))));

        let req = CreateJobRequest {
            owner_id: "42".into(),
            input: Some(JsonValue::Null),
            priority: 0,
        };
        assert!(matches!(req.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_create_request_requires_owner() {
        let req = CreateJobRequest::new("  ", json!({"prompt": "hi"}), 0);
        assert!(matches!(req.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_create_request_priority_defaults_to_zero() {
        let req: CreateJobRequest =
            serde_json::from_value(json!({"owner_id": "7", "input": {"prompt": "x"}})).unwrap();
        assert_eq!(req.priority, 0);
        assert_eq!(req.validate().unwrap(), &json!({"prompt": "x"}));
    }

    #[test]
    fn test_envelope_bytes() {
        let envelope = JobEnvelope {
            id: 9,
            owner_id: "42".into(),
            priority: 5,
            input: json!({"prompt": "hi"}),
        };
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(JobEnvelope::from_bytes(&bytes).unwrap(), envelope);
        assert!(JobEnvelope::from_bytes(b"{not json").is_err());
    }

    #[test]
    fn test_completion_json_shape() {
        let completion = Completion {
            id: Some("chatcmpl-1".into()),
            model: Some("m".into()),
            created: Some(1),
            content: "hello".into(),
            finish_reason: "stop".into(),
            usage: Usage {
                prompt_tokens: 1,
                completion_tokens: 2,
                total_tokens: 3,
            },
        };
        let value = completion.to_json().unwrap();
        assert_eq!(value["content"], "hello");
        assert_eq!(value["finish_reason"], "stop");
        assert_eq!(value["usage"]["total_tokens"], 3);
    }
}
