//! # jobline-db
//!
//! Job store implementations for jobline.
//!
//! This crate provides:
//! - Connection pool management
//! - [`PgJobStore`], the durable PostgreSQL store
//! - [`InMemoryJobStore`], an in-process store with the same contract
//! - SQL migrations for the jobs table and the durable channel table
//!
//! ## Example
//!
//! ```rust,ignore
//! use jobline_db::{CreateJobRequest, Database, JobStore};
//!
//! let db = Database::connect("postgres://localhost/jobline").await?;
//! db.migrate().await?;
//!
//! let job = db
//!     .jobs
//!     .create(CreateJobRequest::new("42", serde_json::json!({"prompt": "hi"}), 5))
//!     .await?;
//! ```

pub mod jobs;
pub mod memory;
pub mod pool;

pub mod test_fixtures;

// Re-export core types
pub use jobline_core::*;

pub use jobs::PgJobStore;
pub use memory::InMemoryJobStore;
pub use pool::{create_pool, PoolConfig, PoolStats};

/// Database context holding the pool and the job store.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Job store for lifecycle operations.
    pub jobs: std::sync::Arc<PgJobStore>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: std::sync::Arc::new(PgJobStore::new(pool.clone())),
            pool,
        }
    }

    /// Replace the job store's transaction lock bound.
    pub fn with_lock_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.jobs = std::sync::Arc::new(PgJobStore::new(self.pool.clone()).with_lock_timeout(timeout));
        self
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    /// Create a new Database instance with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Current connection counts.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats::of(&self.pool)
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
