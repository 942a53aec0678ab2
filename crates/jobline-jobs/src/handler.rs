//! Job handlers: the unit of work the consumer runs for each job.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use jobline_core::defaults::{LLM_MAX_TOKENS, LLM_SYSTEM_PROMPT, LLM_TEMPERATURE};
use jobline_core::{CallError, ChatMessage, CompletionBackend, CompletionRequest, Job};

/// Trait for job handlers.
///
/// `execute` is one attempt; retries and deadlines are applied around it by
/// the [`ExecutionWrapper`](crate::ExecutionWrapper).
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handler name, for logs.
    fn name(&self) -> &str;

    /// Produce the result payload for `job`.
    async fn execute(&self, job: &Job) -> Result<JsonValue, CallError>;
}

/// Defaults applied to every completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionConfig {
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            system_prompt: LLM_SYSTEM_PROMPT.to_string(),
            max_tokens: LLM_MAX_TOKENS,
            temperature: LLM_TEMPERATURE,
        }
    }
}

impl CompletionConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `LLM_SYSTEM_PROMPT` | `You are a helpful assistant.` | System message |
    /// | `LLM_MAX_TOKENS` | `1024` | Completion token cap |
    /// | `LLM_TEMPERATURE` | `0.7` | Sampling temperature |
    pub fn from_env() -> Self {
        let system_prompt = std::env::var("LLM_SYSTEM_PROMPT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| LLM_SYSTEM_PROMPT.to_string());

        let max_tokens = std::env::var("LLM_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(LLM_MAX_TOKENS);

        let temperature = std::env::var("LLM_TEMPERATURE")
            .ok()
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(LLM_TEMPERATURE);

        Self {
            system_prompt,
            max_tokens,
            temperature,
        }
    }
}

/// Sends a job's prompt to a completion backend and stores the completion.
///
/// Job input shape:
///
/// ```json
/// {"prompt": "Summarize ...", "max_tokens": 256, "temperature": 0.2}
/// ```
///
/// Only `prompt` is required. The owner is forwarded as the request's `user`
/// and the job priority as its `priority`.
pub struct CompletionHandler {
    backend: Arc<dyn CompletionBackend>,
    config: CompletionConfig,
}

impl CompletionHandler {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend,
            config: CompletionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CompletionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the completion request for a job.
    pub fn build_request(&self, job: &Job) -> Result<CompletionRequest, CallError> {
        let prompt = job
            .input
            .get("prompt")
            .and_then(JsonValue::as_str)
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                CallError::InvalidInput("input.prompt must be a non-empty string".to_string())
            })?;

        let max_tokens = match job.input.get("max_tokens") {
            None | Some(JsonValue::Null) => self.config.max_tokens,
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .filter(|v| *v > 0)
                .ok_or_else(|| {
                    CallError::InvalidInput("input.max_tokens must be a positive integer".into())
                })?,
        };

        let temperature = match job.input.get("temperature") {
            None | Some(JsonValue::Null) => self.config.temperature,
            Some(value) => value
                .as_f64()
                .filter(|v| (0.0..=2.0).contains(v))
                .map(|v| v as f32)
                .ok_or_else(|| {
                    CallError::InvalidInput("input.temperature must be between 0 and 2".into())
                })?,
        };

        Ok(CompletionRequest {
            model: self.backend.model_name().to_string(),
            messages: vec![
                ChatMessage::system(self.config.system_prompt.clone()),
                ChatMessage::user(prompt),
            ],
            max_tokens,
            temperature,
            priority: job.priority,
            user: Some(job.owner_id.clone()),
        })
    }
}

#[async_trait]
impl JobHandler for CompletionHandler {
    fn name(&self) -> &str {
        "completion"
    }

    async fn execute(&self, job: &Job) -> Result<JsonValue, CallError> {
        let request = self.build_request(job)?;
        let completion = self.backend.complete(&request).await?;

        debug!(
            job_id = job.id,
            model = %request.model,
            total_tokens = completion.usage.total_tokens,
            finish_reason = %completion.finish_reason,
            "Completion received"
        );

        completion
            .to_json()
            .map_err(|e| CallError::InvalidResponse(e.to_string()))
    }
}
