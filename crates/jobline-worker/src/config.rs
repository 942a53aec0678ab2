//! Process-level configuration.

use std::time::Duration;

use jobline_core::defaults::{
    DB_ACQUIRE_TIMEOUT_SECS, DB_MAX_CONNECTIONS, DB_TRANSACTION_TIMEOUT_MS,
    JOB_RECONCILE_INTERVAL_SECS, JOB_STALE_AFTER_SECS,
};
use jobline_db::PoolConfig;

pub const DEFAULT_DATABASE_URL: &str = "postgres://localhost/jobline";

/// Settings owned by the worker binary itself.
///
/// Queue, consumer, retry and LLM settings are read by their own
/// `from_env` constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Bound on waiting for a free pool connection.
    pub acquire_timeout: Duration,
    /// Bound on waiting for a job row lock in a status transaction.
    pub transaction_timeout: Duration,
    /// Pause between stale-job sweeps; zero disables the sweep.
    pub reconcile_interval: Duration,
    /// Age after which a QUEUED job is republished.
    pub stale_after: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DB_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DB_ACQUIRE_TIMEOUT_SECS),
            transaction_timeout: Duration::from_millis(DB_TRANSACTION_TIMEOUT_MS),
            reconcile_interval: Duration::from_secs(JOB_RECONCILE_INTERVAL_SECS),
            stale_after: Duration::from_secs(JOB_STALE_AFTER_SECS),
        }
    }
}

impl AppConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DATABASE_URL` | `postgres://localhost/jobline` | Job store and channel database |
    /// | `DB_MAX_CONNECTIONS` | `10` | Pool size |
    /// | `DB_ACQUIRE_TIMEOUT_SECS` | `30` | Wait for a free pool connection |
    /// | `DB_TRANSACTION_TIMEOUT_MS` | `5000` | Row lock wait in status transactions |
    /// | `JOB_RECONCILE_INTERVAL_SECS` | `60` | Stale-job sweep period (0 = off) |
    /// | `JOB_STALE_AFTER_SECS` | `600` | Age of a QUEUED job considered orphaned |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database_url);

        let max_connections = env_parse::<u32>("DB_MAX_CONNECTIONS")
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_connections);

        let acquire_timeout = env_parse::<u64>("DB_ACQUIRE_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.acquire_timeout);

        let transaction_timeout = env_parse::<u64>("DB_TRANSACTION_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.transaction_timeout);

        let reconcile_interval = env_parse::<u64>("JOB_RECONCILE_INTERVAL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.reconcile_interval);

        let stale_after = env_parse::<u64>("JOB_STALE_AFTER_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.stale_after);

        Self {
            database_url,
            max_connections,
            acquire_timeout,
            transaction_timeout,
            reconcile_interval,
            stale_after,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
