//! # jobline-inference
//!
//! Chat-completion backends for jobline.
//!
//! [`openai::OpenAIBackend`] talks to any OpenAI-compatible endpoint and
//! enforces the completion contract: a non-empty `choices` list with message
//! content and finish reason, and usage accounting. Each call classifies its
//! failure as a [`jobline_core::CallError`] so the execution wrapper can
//! decide whether to retry.

pub mod openai;

#[cfg(feature = "mock")]
pub mod mock;

pub use openai::{OpenAIBackend, OpenAIConfig};

#[cfg(feature = "mock")]
pub use mock::{MockBackend, MockReply};
