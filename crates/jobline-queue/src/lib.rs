//! # jobline-queue
//!
//! Priority channel implementations for jobline.
//!
//! - [`PgChannel`]: durable, lease-based channel over PostgreSQL
//! - [`InMemoryChannel`]: in-process channel with the same delivery
//!   semantics, for tests and single-process deployments
//!
//! Both deliver higher priorities first and publish order within a priority,
//! at least once.

pub mod config;
pub mod memory;
pub mod postgres;

pub use config::ChannelConfig;
pub use memory::{DeadLetter, InMemoryChannel, InMemorySubscription};
pub use postgres::{DeadMessage, PgChannel, PgSubscription};
