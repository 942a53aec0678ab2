//! Channel configuration.

use std::time::Duration;

use jobline_core::defaults::{
    QUEUE_ACK_TIMEOUT_SECS, QUEUE_CAPACITY, QUEUE_MAX_PRIORITY, QUEUE_NAME,
    QUEUE_POLL_INTERVAL_MS,
};

/// Configuration shared by every channel implementation.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Queue name.
    pub name: String,
    /// Highest priority level; published priorities are clamped to it.
    pub max_priority: u8,
    /// Ready messages held before publish reports backpressure.
    pub capacity: usize,
    /// How often an idle durable subscription polls for work.
    pub poll_interval: Duration,
    /// Lease on an unacknowledged durable delivery.
    pub ack_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: QUEUE_NAME.to_string(),
            max_priority: QUEUE_MAX_PRIORITY,
            capacity: QUEUE_CAPACITY,
            poll_interval: Duration::from_millis(QUEUE_POLL_INTERVAL_MS),
            ack_timeout: Duration::from_secs(QUEUE_ACK_TIMEOUT_SECS),
        }
    }
}

impl ChannelConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads:
    /// - `QUEUE_NAME`: queue name (default: job_queue)
    /// - `QUEUE_MAX_PRIORITY`: priority levels (default: 10)
    /// - `QUEUE_CAPACITY`: backpressure threshold (default: 10000)
    /// - `QUEUE_POLL_INTERVAL_MS`: durable poll interval (default: 500)
    /// - `QUEUE_ACK_TIMEOUT_SECS`: durable delivery lease (default: 1800)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let name = std::env::var("QUEUE_NAME")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.name);

        let max_priority = std::env::var("QUEUE_MAX_PRIORITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_priority);

        let capacity = std::env::var("QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(defaults.capacity);

        let poll_interval = std::env::var("QUEUE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let ack_timeout = std::env::var("QUEUE_ACK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.ack_timeout);

        Self {
            name,
            max_priority,
            capacity,
            poll_interval,
            ack_timeout,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_priority(mut self, max_priority: u8) -> Self {
        self.max_priority = max_priority;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Clamp a requested priority into `0..=max_priority`.
    pub fn clamp_priority(&self, priority: u8) -> u8 {
        priority.min(self.max_priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.name, "job_queue");
        assert_eq!(config.max_priority, 10);
        assert_eq!(config.ack_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_builder_and_clamp() {
        let config = ChannelConfig::default()
            .with_name("other")
            .with_max_priority(3)
            .with_capacity(2);
        assert_eq!(config.name, "other");
        assert_eq!(config.capacity, 2);
        assert_eq!(config.clamp_priority(9), 3);
        assert_eq!(config.clamp_priority(1), 1);
    }
}
