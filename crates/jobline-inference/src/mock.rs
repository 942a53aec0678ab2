//! Scripted completion backend for deterministic testing.
//!
//! ```rust
//! use jobline_core::CallError;
//! use jobline_inference::mock::{MockBackend, MockReply};
//!
//! let backend = MockBackend::new()
//!     .with_reply(MockReply::Fail(CallError::Status { status: 500, body: "boom".into() }))
//!     .with_fallback(MockReply::text("Hello!"));
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use jobline_core::{CallError, Completion, CompletionBackend, CompletionRequest, Usage};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    Complete(Completion),
    Fail(CallError),
    /// Never answers; exercises the caller's deadline.
    Hang,
}

impl MockReply {
    /// A successful completion with the given content.
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self::Complete(Completion {
            id: Some("chatcmpl-mock".to_string()),
            model: Some("mock-model".to_string()),
            created: Some(0),
            finish_reason: "stop".to_string(),
            usage: Usage {
                prompt_tokens: 1,
                completion_tokens: content.len() as u32,
                total_tokens: 1 + content.len() as u32,
            },
            content,
        })
    }
}

#[derive(Debug)]
struct MockState {
    script: VecDeque<MockReply>,
    fallback: MockReply,
    calls: Vec<CompletionRequest>,
}

/// Mock completion backend that replays a script, then a fallback.
#[derive(Debug, Clone)]
pub struct MockBackend {
    model: String,
    latency: Duration,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            latency: Duration::ZERO,
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                fallback: MockReply::text("Mock response"),
                calls: Vec::new(),
            })),
        }
    }

    /// Append a reply to the script.
    pub fn with_reply(self, reply: MockReply) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.script.push_back(reply);
        }
        self
    }

    /// Reply used once the script is exhausted.
    pub fn with_fallback(self, reply: MockReply) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.fallback = reply;
        }
        self
    }

    /// Delay before every reply.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Requests received so far.
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().map(|s| s.calls.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CallError> {
        let reply = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| CallError::Transport("mock state poisoned".to_string()))?;
            state.calls.push(request.clone());
            match state.script.pop_front() {
                Some(reply) => reply,
                None => state.fallback.clone(),
            }
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match reply {
            MockReply::Complete(completion) => Ok(completion),
            MockReply::Fail(err) => Err(err),
            MockReply::Hang => std::future::pending().await,
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_core::ChatMessage;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "mock-model".into(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: 8,
            temperature: 0.0,
            priority: 0,
            user: None,
        }
    }

    #[tokio::test]
    async fn test_script_then_fallback() {
        let backend = MockBackend::new()
            .with_reply(MockReply::Fail(CallError::Unreachable("refused".into())))
            .with_fallback(MockReply::text("ok"));

        assert!(matches!(
            backend.complete(&request()).await,
            Err(CallError::Unreachable(_))
        ));
        assert_eq!(backend.complete(&request()).await.unwrap().content, "ok");
        assert_eq!(backend.complete(&request()).await.unwrap().content, "ok");
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_resolves() {
        let backend = MockBackend::new().with_fallback(MockReply::Hang);
        let outcome =
            tokio::time::timeout(Duration::from_secs(60), backend.complete(&request())).await;
        assert!(outcome.is_err());
    }
}
