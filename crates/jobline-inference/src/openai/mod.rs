//! OpenAI-compatible completion backend.
//!
//! Works with any endpoint that speaks the `/chat/completions` protocol
//! (OpenAI, vLLM, LocalAI, Ollama in compatibility mode, LM Studio).
//!
//! # Example
//!
//! ```rust,no_run
//! use jobline_core::{ChatMessage, CompletionBackend, CompletionRequest};
//! use jobline_inference::openai::{OpenAIBackend, OpenAIConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = OpenAIBackend::new(OpenAIConfig {
//!         base_url: "http://localhost:8000/v1".to_string(),
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//!     let request = CompletionRequest {
//!         model: backend.model_name().to_string(),
//!         messages: vec![ChatMessage::user("Hello")],
//!         max_tokens: 64,
//!         temperature: 0.7,
//!         priority: 0,
//!         user: None,
//!     };
//!     let completion = backend.complete(&request).await.unwrap();
//!     println!("{}", completion.content);
//! }
//! ```

mod backend;
mod error;
mod types;

pub use backend::{OpenAIBackend, OpenAIConfig};
pub use error::{classify_transport, OpenAIErrorCode};
pub use types::*;
