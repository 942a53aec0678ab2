//! # jobline-core
//!
//! Core types, lifecycle rules, and trait definitions for the jobline
//! dispatch pipeline.
//!
//! This crate provides the job model, the closed error taxonomy, the status
//! state machine, and the traits the store, channel, and completion backends
//! implement.

pub mod defaults;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{CallError, Error, ErrorKind, JobError, JobFailure, Result};
pub use lifecycle::{check_transition, plan_update, StatusChange, Transition};
pub use models::*;
pub use traits::*;
