//! Job store implementation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, warn};

use jobline_core::defaults::DB_TRANSACTION_TIMEOUT_MS;
use jobline_core::{
    plan_update, CreateJobRequest, Error, Job, JobStore, Result, StatusChange,
};

use crate::pool::PoolStats;

const JOB_COLUMNS: &str = "id, owner_id, input, priority, status::text AS status, result, \
                           error_message, created_at, updated_at, started_at, completed_at, \
                           published_at";

/// SQLSTATE `lock_not_available`, raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

fn is_lock_timeout(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(LOCK_NOT_AVAILABLE),
        _ => false,
    }
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: Pool<Postgres>,
    /// Bound on row-lock waits inside a status-update transaction.
    lock_timeout: Duration,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            lock_timeout: Duration::from_millis(DB_TRANSACTION_TIMEOUT_MS),
        }
    }

    /// Override the lock wait bound used by `update_status`.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let status: String = row.get("status");
        Ok(Job {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            input: row.get("input"),
            priority: row.get("priority"),
            status: status.parse()?,
            result: row.get("result"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            published_at: row.get("published_at"),
        })
    }

    /// Map a failed row-lock read, logging pool pressure on a lock timeout.
    fn lock_error(&self, id: i64, e: sqlx::Error) -> Error {
        if is_lock_timeout(&e) {
            let stats = PoolStats::of(&self.pool);
            warn!(
                subsystem = "database",
                job_id = id,
                lock_timeout_ms = self.lock_timeout.as_millis() as u64,
                pool_size = stats.size,
                pool_idle = stats.idle,
                pool_exhausted = stats.is_exhausted(),
                "Timed out waiting for job row lock"
            );
        }
        Error::Database(e)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, req: CreateJobRequest) -> Result<Job> {
        let input = req.validate()?;

        let row = sqlx::query(&format!(
            "INSERT INTO jobs (owner_id, input, priority, status, created_at, updated_at)
             VALUES ($1, $2, $3, 'QUEUED'::job_status, $4, $4)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&req.owner_id)
        .bind(input)
        .bind(req.priority)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_job_row(row)
    }

    async fn get(&self, id: i64) -> Result<Job> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_job_row(row),
            None => Err(Error::job_not_found(id)),
        }
    }

    async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE owner_id = $1
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn update_status(&self, id: i64, change: StatusChange) -> Result<Job> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Scoped to this transaction; a contended row fails fast instead of
        // parking the connection.
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| self.lock_error(id, e))?;

        let current = match row {
            Some(row) => Self::parse_job_row(row)?,
            None => return Err(Error::job_not_found(id)),
        };

        let Some(next) = plan_update(&current, change, Utc::now())? else {
            tx.commit().await.map_err(Error::Database)?;
            debug!(job_id = id, status = %current.status, "Status re-applied, no change");
            return Ok(current);
        };

        let row = sqlx::query(&format!(
            "UPDATE jobs
             SET status = $2::job_status, result = $3, error_message = $4,
                 updated_at = $5, started_at = $6, completed_at = $7
             WHERE id = $1
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .bind(next.status.as_str())
        .bind(&next.result)
        .bind(&next.error_message)
        .bind(next.updated_at)
        .bind(next.started_at)
        .bind(next.completed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            job_id = id,
            from = %current.status,
            to = %next.status,
            "Job status updated"
        );
        Self::parse_job_row(row)
    }

    async fn next_queued(&self) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'QUEUED'::job_status
             ORDER BY priority DESC, created_at ASC, id ASC
             LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let done = sqlx::query("UPDATE jobs SET published_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        if done.rows_affected() == 0 {
            return Err(Error::job_not_found(id));
        }
        Ok(())
    }

    async fn list_stale_queued(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE status = 'QUEUED'::job_status
               AND COALESCE(published_at, created_at) < $1
             ORDER BY COALESCE(published_at, created_at) ASC, id ASC
             LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }
}
