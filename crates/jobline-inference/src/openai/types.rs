//! OpenAI API request and response types.

use serde::{Deserialize, Serialize};

use jobline_core::{CallError, ChatMessage, Completion, CompletionRequest, Usage};

// =============================================================================
// CHAT COMPLETION TYPES
// =============================================================================

/// Request body for the chat completions endpoint.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub max_tokens: u32,
    pub temperature: f32,
    /// Scheduling hint understood by self-hosted gateways; ignored elsewhere.
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<&'a str>,
    pub stream: bool,
}

impl<'a> From<&'a CompletionRequest> for ChatCompletionRequest<'a> {
    fn from(req: &'a CompletionRequest) -> Self {
        Self {
            model: &req.model,
            messages: &req.messages,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            priority: req.priority,
            user: req.user.as_deref(),
            stream: false,
        }
    }
}

/// Response from the chat completions endpoint.
///
/// Every field is optional on the wire; [`ChatCompletionResponse::into_completion`]
/// decides what the pipeline accepts.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub choices: Option<Vec<ChatChoice>>,
    #[serde(default)]
    pub usage: Option<ChatUsage>,
}

/// Single chat completion choice.
#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub message: Option<ResponseMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Message inside a choice.
#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Token usage for chat completion request.
#[derive(Debug, Deserialize)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ChatCompletionResponse {
    /// Check the completion contract and keep the first choice.
    ///
    /// Requires a non-empty `choices` list where every choice carries message
    /// content and a finish reason, plus usage accounting.
    pub fn into_completion(self) -> Result<Completion, CallError> {
        let choices = self
            .choices
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CallError::InvalidResponse("no choices in response".to_string()))?;

        for (i, choice) in choices.iter().enumerate() {
            if choice.message.as_ref().and_then(|m| m.content.as_ref()).is_none() {
                return Err(CallError::InvalidResponse(format!(
                    "choice {i} has no message content"
                )));
            }
            if choice.finish_reason.is_none() {
                return Err(CallError::InvalidResponse(format!(
                    "choice {i} has no finish_reason"
                )));
            }
        }

        let usage = self
            .usage
            .ok_or_else(|| CallError::InvalidResponse("no usage in response".to_string()))?;

        let first = choices.into_iter().next();
        let (content, finish_reason) = first
            .and_then(|c| Some((c.message?.content?, c.finish_reason?)))
            .ok_or_else(|| CallError::InvalidResponse("no choices in response".to_string()))?;

        Ok(Completion {
            id: self.id,
            model: self.model,
            created: self.created,
            content,
            finish_reason,
            usage: Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        })
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Error response from OpenAI API.
#[derive(Debug, Deserialize)]
pub struct OpenAIErrorResponse {
    pub error: OpenAIError,
}

/// Detailed error information.
#[derive(Debug, Deserialize)]
pub struct OpenAIError {
    pub message: String,
    #[serde(rename = "type", default)]
    pub error_type: String,
    pub code: Option<String>,
}
