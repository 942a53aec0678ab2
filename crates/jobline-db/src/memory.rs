//! In-process job store.
//!
//! Same contract as [`PgJobStore`](crate::PgJobStore), held in memory. Used
//! by tests and by single-process deployments that do not need durability.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use jobline_core::{
    plan_update, CreateJobRequest, Error, Job, JobStatus, JobStore, Result, StatusChange,
};

#[derive(Debug, Default)]
struct StoreState {
    next_id: i64,
    /// Keyed by id, so iteration order is creation order.
    jobs: BTreeMap<i64, Job>,
}

/// In-memory implementation of JobStore.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<RwLock<StoreState>>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("state", &"<RwLock<StoreState>>")
            .finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite a job's creation time. Lets tests age a job past the
    /// orphan threshold without sleeping.
    pub async fn backdate(&self, id: i64, created_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(&id).ok_or_else(|| Error::job_not_found(id))?;
        job.created_at = created_at;
        Ok(())
    }

    /// Overwrite a job's last publish time.
    pub async fn backdate_publish(&self, id: i64, published_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(&id).ok_or_else(|| Error::job_not_found(id))?;
        job.published_at = Some(published_at);
        Ok(())
    }
}

/// Reference time of the orphan sweep: the last publish, else creation.
fn last_enqueued(job: &Job) -> DateTime<Utc> {
    job.published_at.unwrap_or(job.created_at)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, req: CreateJobRequest) -> Result<Job> {
        let input = req.validate()?.clone();
        let now = Utc::now();

        let mut state = self.state.write().await;
        state.next_id += 1;
        let job = Job {
            id: state.next_id,
            owner_id: req.owner_id,
            input,
            priority: req.priority,
            status: JobStatus::Queued,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            published_at: None,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: i64) -> Result<Job> {
        let state = self.state.read().await;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::job_not_found(id))
    }

    async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs)
    }

    async fn update_status(&self, id: i64, change: StatusChange) -> Result<Job> {
        // The write lock is the transaction: read, check and write happen
        // without interleaving.
        let mut state = self.state.write().await;
        let current = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::job_not_found(id))?;

        if let Some(next) = plan_update(current, change, Utc::now())? {
            *current = next;
        }
        Ok(current.clone())
    }

    async fn next_queued(&self) -> Result<Option<Job>> {
        let state = self.state.read().await;
        let next = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .cloned();
        Ok(next)
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(&id).ok_or_else(|| Error::job_not_found(id))?;
        job.published_at = Some(at);
        Ok(())
    }

    async fn list_stale_queued(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && last_enqueued(j) < older_than)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| last_enqueued(a).cmp(&last_enqueued(b)).then(a.id.cmp(&b.id)));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_core::UpdateJobStatusRequest;
    use serde_json::json;

    fn req(owner: &str, priority: i32) -> CreateJobRequest {
        CreateJobRequest::new(owner, json!({"prompt": "hi"}), priority)
    }

    #[tokio::test]
    async fn test_create_starts_queued() {
        let store = InMemoryJobStore::new();
        let job = store.create(req("42", 5)).await.unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 5);
        assert_eq!(job.input, json!({"prompt": "hi"}));
        assert!(job.started_at.is_none());
        assert_eq!(store.get(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_create_without_input_is_rejected() {
        let store = InMemoryJobStore::new();
        let err = store
            .create(CreateJobRequest {
                owner_id: "42".into(),
                input: None,
                priority: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryJobStore::new();
        assert!(matches!(store.get(99).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_for_owner_newest_first() {
        let store = InMemoryJobStore::new();
        let a = store.create(req("42", 0)).await.unwrap();
        let _other = store.create(req("7", 0)).await.unwrap();
        let b = store.create(req("42", 9)).await.unwrap();

        let ids: Vec<i64> = store
            .list_for_owner("42")
            .await
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn test_next_queued_priority_then_fifo() {
        let store = InMemoryJobStore::new();
        let low = store.create(req("1", 1)).await.unwrap();
        let high_first = store.create(req("1", 8)).await.unwrap();
        let high_second = store.create(req("1", 8)).await.unwrap();

        assert_eq!(store.next_queued().await.unwrap().unwrap().id, high_first.id);

        store
            .update_status(high_first.id, StatusChange::processing())
            .await
            .unwrap();
        assert_eq!(store.next_queued().await.unwrap().unwrap().id, high_second.id);

        store
            .update_status(high_second.id, StatusChange::processing())
            .await
            .unwrap();
        assert_eq!(store.next_queued().await.unwrap().unwrap().id, low.id);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let store = InMemoryJobStore::new();
        let job = store.create(req("42", 0)).await.unwrap();

        let running = store
            .update_status(job.id, StatusChange::processing())
            .await
            .unwrap();
        assert!(running.started_at.is_some());

        let done = store
            .update_status(job.id, StatusChange::completed(json!({"content": "ok"})))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.started_at, running.started_at);
    }

    #[tokio::test]
    async fn test_terminal_is_immutable() {
        let store = InMemoryJobStore::new();
        let job = store.create(req("42", 0)).await.unwrap();
        store
            .update_status(job.id, StatusChange::processing())
            .await
            .unwrap();
        let failed = store
            .update_status(job.id, StatusChange::failed("LLM API error: 500"))
            .await
            .unwrap();

        let err = store
            .update_status(job.id, StatusChange::completed(json!({"content": "late"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Business(_)));

        let again = store
            .update_status(job.id, StatusChange::failed("another message"))
            .await
            .unwrap();
        assert_eq!(again, failed);
        assert_eq!(store.get(job.id).await.unwrap(), failed);
    }

    #[tokio::test]
    async fn test_bogus_status_leaves_job_unchanged() {
        let store = InMemoryJobStore::new();
        let job = store.create(req("42", 0)).await.unwrap();

        let err = store
            .apply_status_request(
                job.id,
                UpdateJobStatusRequest {
                    status: "BOGUS".into(),
                    result: None,
                    error_message: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.get(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_status_request_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store
            .apply_status_request(
                404,
                UpdateJobStatusRequest {
                    status: "BOGUS".into(),
                    result: None,
                    error_message: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_failed_on_queued_both_rejected() {
        let store = InMemoryJobStore::new();
        let job = store.create(req("42", 0)).await.unwrap();

        let (a, b) = tokio::join!(
            store.update_status(job.id, StatusChange::failed("x")),
            store.update_status(job.id, StatusChange::failed("y")),
        );
        assert!(matches!(a, Err(Error::Business(_))));
        assert!(matches!(b, Err(Error::Business(_))));
        assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_concurrent_terminal_writes_one_wins() {
        let store = InMemoryJobStore::new();
        let job = store.create(req("42", 0)).await.unwrap();
        store
            .update_status(job.id, StatusChange::processing())
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            store.update_status(job.id, StatusChange::completed(json!({"n": 1}))),
            store.update_status(job.id, StatusChange::failed("lost race")),
        );
        assert!(a.is_ok() != b.is_ok(), "exactly one transition must win");
    }

    #[tokio::test]
    async fn test_list_stale_queued() {
        let store = InMemoryJobStore::new();
        let old = store.create(req("42", 0)).await.unwrap();
        let fresh = store.create(req("42", 0)).await.unwrap();
        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        store
            .backdate(old.id, cutoff - chrono::Duration::minutes(1))
            .await
            .unwrap();

        let stale = store.list_stale_queued(cutoff, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
        assert_ne!(stale[0].id, fresh.id);

        assert!(store.list_stale_queued(cutoff, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_publish_is_not_stale() {
        let store = InMemoryJobStore::new();
        let job = store.create(req("42", 0)).await.unwrap();
        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        store
            .backdate(job.id, cutoff - chrono::Duration::minutes(10))
            .await
            .unwrap();

        store.mark_published(job.id, Utc::now()).await.unwrap();
        assert!(store.list_stale_queued(cutoff, 10).await.unwrap().is_empty());

        store
            .backdate_publish(job.id, cutoff - chrono::Duration::minutes(1))
            .await
            .unwrap();
        let stale = store.list_stale_queued(cutoff, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert!(stale[0].published_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_published_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store.mark_published(404, Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
