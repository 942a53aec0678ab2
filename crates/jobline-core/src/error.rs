//! Error types for jobline.
//!
//! Every fallible operation in the pipeline returns [`Error`]. The variants form
//! a closed taxonomy so callers match on the tag instead of downcasting:
//!
//! | Variant | Code | Class | Retried |
//! |---------|------|-------|---------|
//! | `Validation` | `INVALID_INPUT` | 4xx | never |
//! | `NotFound` | `JOB_NOT_FOUND` | 4xx | never |
//! | `Business` | `BUSINESS_ERROR` | 4xx | never |
//! | `Job` | `JOB_PROCESSING_FAILED` / `JOB_TIMEOUT` | recorded on the job | inside the execution wrapper only |
//! | `Database` | `DATABASE_ERROR` | 5xx | never at this layer |
//! | `Queue` | `QUEUE_ERROR` | 5xx | never |

use thiserror::Error;

/// Result type alias using jobline's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for jobline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown job id or other missing resource.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Illegal state transition or broken contract.
    #[error("Business rule violated: {0}")]
    Business(String),

    /// Execution failed after the retry budget was spent.
    #[error(transparent)]
    Job(#[from] JobError),

    /// Store unavailable or transaction failure (wraps sqlx::Error).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Channel unavailable, or publish/consume setup failure.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Tag of an [`Error`], used at boundaries that map errors to codes or statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Business,
    JobFailed,
    JobTimeout,
    Database,
    Queue,
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable error code.
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "INVALID_INPUT",
            Self::NotFound => "JOB_NOT_FOUND",
            Self::Business => "BUSINESS_ERROR",
            Self::JobFailed => "JOB_PROCESSING_FAILED",
            Self::JobTimeout => "JOB_TIMEOUT",
            Self::Database => "DATABASE_ERROR",
            Self::Queue => "QUEUE_ERROR",
            Self::Internal => "INTERNAL_SERVER_ERROR",
        }
    }

    /// HTTP status an API layer should answer with.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Validation | Self::Business | Self::JobFailed | Self::JobTimeout => 400,
            Self::NotFound => 404,
            Self::Database | Self::Queue | Self::Internal => 500,
        }
    }

    /// Whether the failure is the caller's fault (4xx class).
    pub fn is_client_error(self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

impl Error {
    /// The tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Serialization(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Business(_) => ErrorKind::Business,
            Error::Job(e) if e.failure == JobFailure::TimedOut => ErrorKind::JobTimeout,
            Error::Job(_) => ErrorKind::JobFailed,
            Error::Database(_) => ErrorKind::Database,
            Error::Queue(_) => ErrorKind::Queue,
            Error::Config(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for a missing job.
    pub fn job_not_found(id: i64) -> Self {
        Error::NotFound(format!("job {id} not found"))
    }
}

// =============================================================================
// REMOTE CALL FAILURES
// =============================================================================

/// Failure of a single attempt at the remote completion call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The service refused the connection.
    #[error("connection refused: {0}")]
    Unreachable(String),

    /// The attempt exceeded a deadline (client-side or execution wrapper).
    #[error("timed out: {0}")]
    TimedOut(String),

    /// The service answered with a non-2xx status.
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response did not satisfy the completion contract.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The job input cannot be turned into a request.
    #[error("invalid job input: {0}")]
    InvalidInput(String),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl CallError {
    /// Whether another attempt may succeed.
    ///
    /// Contract violations and bad input fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidResponse(_) | Self::InvalidInput(_))
    }

    /// Classify this failure for the job record.
    pub fn failure(&self) -> JobFailure {
        match self {
            Self::Unreachable(_) => JobFailure::Unreachable,
            Self::TimedOut(_) => JobFailure::TimedOut,
            Self::Status { status: 504, .. } => JobFailure::TimedOut,
            Self::Status { status, .. } => JobFailure::RemoteStatus(*status),
            Self::InvalidResponse(_) => JobFailure::InvalidResponse,
            Self::InvalidInput(_) => JobFailure::InvalidInput,
            Self::Transport(_) => JobFailure::Other,
        }
    }
}

/// Classification of an exhausted job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobFailure {
    /// Connection refused on the last attempt.
    Unreachable,
    /// Deadline expiry or gateway timeout on the last attempt.
    TimedOut,
    /// Any other non-2xx response, with its status code.
    RemoteStatus(u16),
    /// The remote answered but broke the response contract.
    InvalidResponse,
    /// The job input could not be turned into a request.
    InvalidInput,
    /// Unclassified failure.
    Other,
}

impl JobFailure {
    /// User-facing message recorded on the failed job.
    pub fn message(self) -> String {
        match self {
            Self::Unreachable => "LLM service unreachable".to_string(),
            Self::TimedOut => "LLM request timed out".to_string(),
            Self::RemoteStatus(status) => format!("LLM API error: {status}"),
            Self::InvalidResponse => "LLM API returned an invalid response".to_string(),
            Self::InvalidInput => "Job input is invalid".to_string(),
            Self::Other => "LLM processing failed".to_string(),
        }
    }

    /// Error code, so timeouts can be alerted on separately.
    pub fn code(self) -> &'static str {
        match self {
            Self::TimedOut => ErrorKind::JobTimeout.code(),
            _ => ErrorKind::JobFailed.code(),
        }
    }
}

/// Execution failure surfaced once the attempt budget is exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (job {job_id}, {attempts} attempt(s)): {cause}")]
pub struct JobError {
    /// Job the execution belonged to.
    pub job_id: i64,
    /// Attempts actually made.
    pub attempts: u32,
    /// Classification of the last failure.
    pub failure: JobFailure,
    /// User-facing message, written to the job's error message.
    pub message: String,
    /// The last underlying error.
    pub cause: CallError,
}

impl JobError {
    /// Build from the last attempt's failure.
    pub fn exhausted(job_id: i64, attempts: u32, cause: CallError) -> Self {
        let failure = cause.failure();
        Self {
            job_id,
            attempts,
            failure,
            message: failure.message(),
            cause,
        }
    }

    /// Error code for this failure.
    pub fn code(&self) -> &'static str {
        self.failure.code()
    }

    /// Text recorded as the failed job's error message.
    ///
    /// Remote failures keep the short user-facing message; contract and
    /// input failures carry the cause, since retrying will not change it.
    pub fn record_message(&self) -> String {
        match self.failure {
            JobFailure::InvalidInput | JobFailure::InvalidResponse | JobFailure::Other => {
                format!("{}: {}", self.message, self.cause)
            }
            _ => self.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_validation() {
        let err = Error::Validation("input is required".to_string());
        assert_eq!(err.to_string(), "Validation error: input is required");
    }

    #[test]
    fn test_job_not_found_message() {
        let err = Error::job_not_found(7);
        assert_eq!(err.to_string(), "Not found: job 7 not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(ErrorKind::Validation.code(), "INVALID_INPUT");
        assert_eq!(ErrorKind::NotFound.code(), "JOB_NOT_FOUND");
        assert_eq!(ErrorKind::Business.code(), "BUSINESS_ERROR");
        assert_eq!(ErrorKind::JobTimeout.code(), "JOB_TIMEOUT");
        assert_eq!(ErrorKind::Queue.code(), "QUEUE_ERROR");
    }

    #[test]
    fn test_kind_http_status_classes() {
        assert!(Error::Validation("x".into()).kind().is_client_error());
        assert!(Error::Business("x".into()).kind().is_client_error());
        assert_eq!(Error::job_not_found(1).kind().http_status(), 404);
        assert_eq!(Error::Queue("down".into()).kind().http_status(), 500);
        assert_eq!(
            Error::Database(sqlx::Error::PoolTimedOut).kind().http_status(),
            500
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_call_error_retryable() {
        assert!(CallError::Unreachable("refused".into()).is_retryable());
        assert!(CallError::TimedOut("slow".into()).is_retryable());
        assert!(CallError::Status {
            status: 500,
            body: String::new()
        }
        .is_retryable());
        assert!(!CallError::InvalidResponse("no choices".into()).is_retryable());
        assert!(!CallError::InvalidInput("no prompt".into()).is_retryable());
    }

    #[test]
    fn test_gateway_timeout_classified_as_timeout() {
        let err = CallError::Status {
            status: 504,
            body: "gateway timeout".into(),
        };
        assert_eq!(err.failure(), JobFailure::TimedOut);
        assert_eq!(err.failure().code(), "JOB_TIMEOUT");
    }

    #[test]
    fn test_failure_messages() {
        assert_eq!(JobFailure::Unreachable.message(), "LLM service unreachable");
        assert_eq!(JobFailure::TimedOut.message(), "LLM request timed out");
        assert_eq!(JobFailure::RemoteStatus(503).message(), "LLM API error: 503");
    }

    #[test]
    fn test_job_error_exhausted() {
        let err = JobError::exhausted(
            42,
            4,
            CallError::Status {
                status: 500,
                body: "boom".into(),
            },
        );
        assert_eq!(err.job_id, 42);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.failure, JobFailure::RemoteStatus(500));
        assert_eq!(err.message, "LLM API error: 500");
        assert_eq!(err.code(), "JOB_PROCESSING_FAILED");

        let display = err.to_string();
        assert!(display.contains("job 42"));
        assert!(display.contains("boom"));
    }

    #[test]
    fn test_record_message() {
        let remote = JobError::exhausted(1, 4, CallError::Unreachable("refused".into()));
        assert_eq!(remote.record_message(), "LLM service unreachable");

        let input = JobError::exhausted(1, 1, CallError::InvalidInput("no prompt".into()));
        assert_eq!(
            input.record_message(),
            "Job input is invalid: invalid job input: no prompt"
        );
    }

    #[test]
    fn test_job_error_timeout_kind() {
        let err: Error = JobError::exhausted(1, 4, CallError::TimedOut("deadline".into())).into();
        assert_eq!(err.kind(), ErrorKind::JobTimeout);
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
