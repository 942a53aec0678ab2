//! # jobline-jobs
//!
//! Job dispatch and execution for jobline.
//!
//! This crate provides:
//! - [`Dispatcher`]: persists a job, then publishes it to the priority channel
//! - [`JobConsumer`]: pulls deliveries, drives each job QUEUED → PROCESSING →
//!   COMPLETED/FAILED, and acknowledges only after the terminal write
//! - [`ExecutionWrapper`]: bounded fixed-delay retries with a per-attempt deadline
//! - [`CompletionHandler`]: the remote completion call behind each job
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use jobline_jobs::{CompletionHandler, ConsumerConfig, Dispatcher, JobConsumer};
//!
//! let dispatcher = Dispatcher::new(store.clone(), channel.clone());
//! let job = dispatcher
//!     .create_job(CreateJobRequest::new("42", json!({"prompt": "hi"}), 5))
//!     .await?;
//!
//! let handler = Arc::new(CompletionHandler::new(backend));
//! let handle = JobConsumer::new(store, channel, handler, ConsumerConfig::from_env()).start();
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod consumer;
pub mod dispatcher;
pub mod handler;
pub mod retry;

// Re-export core types
pub use jobline_core::*;

pub use consumer::{
    ConsumerConfig, ConsumerEvent, ConsumerHandle, DeliveryOutcome, JobConsumer, SkipReason,
};
pub use dispatcher::{channel_priority, Dispatcher, ReconcileReport};
pub use handler::{CompletionConfig, CompletionHandler, JobHandler};
pub use retry::{ExecutionWrapper, RetryPolicy};
