//! OpenAI-compatible completion backend implementation.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use jobline_core::defaults::{LLM_API_URL, LLM_MODEL, LLM_REQUEST_TIMEOUT_SECS};
use jobline_core::{CallError, Completion, CompletionBackend, CompletionRequest, Error, Result};

use super::error::{classify_transport, OpenAIErrorCode};
use super::types::*;

/// Longest slice of an error body kept for logs and job records.
const ERROR_BODY_LIMIT: usize = 512;

/// Configuration for OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    /// Base URL for the API endpoint.
    pub base_url: String,
    /// API key for authentication (optional for local endpoints).
    pub api_key: Option<String>,
    /// Model to use for completions.
    pub model: String,
    /// Client-side request timeout in seconds.
    pub timeout_seconds: u64,
    /// Skip TLS verification (for self-signed certs in local environments).
    pub skip_tls_verify: bool,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: LLM_API_URL.to_string(),
            api_key: None,
            model: LLM_MODEL.to_string(),
            timeout_seconds: LLM_REQUEST_TIMEOUT_SECS,
            skip_tls_verify: false,
        }
    }
}

impl OpenAIConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads `LLM_API_URL`, `LLM_API_KEY`, `LLM_MODEL`, `LLM_TIMEOUT_SECS`
    /// and `LLM_SKIP_TLS_VERIFY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("LLM_API_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("LLM_API_KEY").ok().filter(|k| !k.is_empty()),
            model: std::env::var("LLM_MODEL").unwrap_or(defaults.model),
            timeout_seconds: std::env::var("LLM_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_seconds),
            skip_tls_verify: std::env::var("LLM_SKIP_TLS_VERIFY")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
        }
    }
}

/// OpenAI-compatible completion backend.
pub struct OpenAIBackend {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIBackend {
    /// Create a new OpenAI backend with the given configuration.
    pub fn new(config: OpenAIConfig) -> Result<Self> {
        let mut client_builder =
            Client::builder().timeout(Duration::from_secs(config.timeout_seconds));

        if config.skip_tls_verify {
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        let client = client_builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "inference",
            base_url = %config.base_url,
            model = %config.model,
            timeout_secs = config.timeout_seconds,
            "Initializing OpenAI backend"
        );

        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(OpenAIConfig::from_env())
    }

    /// Get the current configuration.
    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    /// Build a request with authentication if configured.
    fn build_request(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(self.url(endpoint));
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }
        req
    }

    /// Check that the endpoint answers a model listing.
    pub async fn health_check(&self) -> bool {
        let mut req = self
            .client
            .get(self.url("/models"))
            .timeout(Duration::from_secs(5));
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(subsystem = "inference", "LLM health check passed");
                true
            }
            Ok(resp) => {
                warn!(subsystem = "inference", status = %resp.status(), "LLM health check failed");
                false
            }
            Err(e) => {
                warn!(subsystem = "inference", error = %e, "LLM health check error");
                false
            }
        }
    }
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[async_trait]
impl CompletionBackend for OpenAIBackend {
    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<Completion, CallError> {
        let start = Instant::now();
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            max_tokens = request.max_tokens,
            priority = request.priority,
            "Sending completion request"
        );

        let response = self
            .build_request("/chat/completions")
            .json(&ChatCompletionRequest::from(request))
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (message, error_type) = match serde_json::from_str::<OpenAIErrorResponse>(&body) {
                Ok(parsed) => (parsed.error.message, parsed.error.error_type),
                Err(_) => (truncate(&body), String::new()),
            };
            let code = OpenAIErrorCode::from_response(status.as_u16(), &error_type);
            warn!(
                status = status.as_u16(),
                error_code = code.as_str(),
                duration_ms = start.elapsed().as_millis() as u64,
                "LLM API returned an error"
            );
            return Err(CallError::Status {
                status: status.as_u16(),
                body: message,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CallError::InvalidResponse(format!("failed to parse response: {e}")))?;
        let completion = parsed.into_completion()?;

        debug!(
            finish_reason = %completion.finish_reason,
            total_tokens = completion.usage.total_tokens,
            duration_ms = start.elapsed().as_millis() as u64,
            "Completion received"
        );
        Ok(completion)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OpenAIConfig::default();
        assert_eq!(config.base_url, LLM_API_URL);
        assert_eq!(config.model, LLM_MODEL);
        assert_eq!(config.timeout_seconds, 540);
        assert!(!config.skip_tls_verify);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_backend_creation_and_model_name() {
        let backend = OpenAIBackend::new(OpenAIConfig {
            model: "test-gen".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(backend.model_name(), "test-gen");
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let backend = OpenAIBackend::new(OpenAIConfig {
            base_url: "http://localhost:8000/v1/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            backend.url("/chat/completions"),
            "http://localhost:8000/v1/chat/completions"
        );
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(ERROR_BODY_LIMIT + 10);
        let out = truncate(&body);
        assert!(out.ends_with("..."));
        assert_eq!(out.len(), ERROR_BODY_LIMIT + 3);
        assert_eq!(truncate("short"), "short");
    }
}
