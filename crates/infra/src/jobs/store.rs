//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::types::{Job, JobId, JobStatus};

/// Job store abstraction.
///
/// Implementations must make `claim_next` atomic: a ready job is handed to
/// exactly one caller, which then owns it until it reports an outcome or its
/// lease expires.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Enqueue a new job. Fails with `AlreadyExists` if its id or dedupe key is taken.
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Get the job registered under a dedupe key.
    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<Job>, JobStoreError>;

    /// Claim the oldest ready job of `queue` for `lease`.
    ///
    /// Jobs that stalled on their final delivery are dead-lettered on the way
    /// and handed back in [`Claim::stalled_out`].
    async fn claim_next(&self, queue: &str, lease: Duration) -> Result<Claim, JobStoreError>;

    /// Record a successful delivery `attempt`.
    async fn complete(&self, job_id: JobId, attempt: u32) -> Result<Job, JobStoreError>;

    /// Record a failed delivery `attempt`; applies the job's retry policy.
    async fn fail(&self, job_id: JobId, attempt: u32, error: &str) -> Result<Job, JobStoreError>;

    /// Return delivery `attempt` to the queue without consuming it.
    async fn release(&self, job_id: JobId, attempt: u32) -> Result<(), JobStoreError>;

    /// Get job statistics for a queue.
    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError>;
}

/// Result of a claim.
#[derive(Debug, Clone, Default)]
pub struct Claim {
    /// The delivery now leased to the caller, if any job was ready.
    pub job: Option<Job>,
    /// Jobs whose final lease expired during this claim, now dead-lettered.
    pub stalled_out: Vec<Job>,
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(String),
    #[error("job {0} is no longer owned by this delivery")]
    LeaseLost(JobId),
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl JobStats {
    fn count(&mut self, status: &JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed { .. } => self.failed += 1,
            JobStatus::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    dedupe: HashMap<String, JobId>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    /// Apply `f` to a job currently owned by delivery `attempt`.
    fn with_owned_job<T>(
        &self,
        job_id: JobId,
        attempt: u32,
        f: impl FnOnce(&mut Job) -> T,
    ) -> Result<T, JobStoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !job.is_owned_by(attempt) {
            return Err(JobStoreError::LeaseLost(job_id));
        }
        Ok(f(job))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id.to_string()));
        }
        if let Some(key) = &job.dedupe_key {
            if inner.dedupe.contains_key(key) {
                return Err(JobStoreError::AlreadyExists(key.clone()));
            }
            inner.dedupe.insert(key.clone(), job.id);
        }
        let id = job.id;
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        let inner = self.read()?;
        Ok(inner.dedupe.get(key).and_then(|id| inner.jobs.get(id)).cloned())
    }

    async fn claim_next(&self, queue: &str, lease: Duration) -> Result<Claim, JobStoreError> {
        let mut inner = self.write()?;
        let now = Utc::now();

        // A job that stalled on its last allowed delivery is exhausted, not redelivered.
        let mut stalled_out = Vec::new();
        for job in inner.jobs.values_mut() {
            if job.queue == queue && job.is_stalled(now) && job.retry_policy.is_exhausted(job.attempt) {
                warn!(job_id = %job.id, attempts = job.attempt, "stalled job dead-lettered");
                job.mark_stalled_out(now);
                stalled_out.push(job.clone());
            }
        }

        // Oldest ready job first (FIFO)
        let next = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.is_ready(now))
            .min_by_key(|j| (j.created_at, j.id.0))
            .map(|j| j.id);

        let job = next.and_then(|id| {
            inner.jobs.get_mut(&id).map(|job| {
                job.mark_running(now, lease);
                job.clone()
            })
        });
        Ok(Claim { job, stalled_out })
    }

    async fn complete(&self, job_id: JobId, attempt: u32) -> Result<Job, JobStoreError> {
        self.with_owned_job(job_id, attempt, |job| {
            job.mark_completed(Utc::now());
            job.clone()
        })
    }

    async fn fail(&self, job_id: JobId, attempt: u32, error: &str) -> Result<Job, JobStoreError> {
        self.with_owned_job(job_id, attempt, |job| {
            job.mark_failed(error.to_string(), Utc::now());
            job.clone()
        })
    }

    async fn release(&self, job_id: JobId, attempt: u32) -> Result<(), JobStoreError> {
        self.with_owned_job(job_id, attempt, |job| job.mark_released(Utc::now()))
    }

    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values().filter(|j| j.queue == queue) {
            stats.count(&job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{RetryPolicy, STALLED_OUT_ERROR};

    const LEASE: Duration = Duration::from_secs(30);

    fn job() -> Job {
        Job::new("test", serde_json::json!({}))
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();

        let job_id = store.enqueue(job()).await.unwrap();

        let claimed = store.claim_next("test", LEASE).await.unwrap().job.unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);

        // No more jobs
        assert!(store.claim_next("test", LEASE).await.unwrap().job.is_none());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let store = InMemoryJobStore::new();
        store.enqueue(job()).await.unwrap();

        assert!(store.claim_next("other", LEASE).await.unwrap().job.is_none());
        assert!(store.claim_next("test", LEASE).await.unwrap().job.is_some());
    }

    #[tokio::test]
    async fn claims_in_fifo_order() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(job()).await.unwrap();
        let second = store.enqueue(job()).await.unwrap();

        assert_eq!(store.claim_next("test", LEASE).await.unwrap().job.unwrap().id, first);
        assert_eq!(store.claim_next("test", LEASE).await.unwrap().job.unwrap().id, second);
    }

    #[tokio::test]
    async fn dedupe_key_is_unique() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job().with_dedupe_key("booking:1")).await.unwrap();

        let err = store.enqueue(job().with_dedupe_key("booking:1")).await.unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(_)));

        let found = store.find_by_dedupe_key("booking:1").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(store.find_by_dedupe_key("booking:2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_job_waits_for_backoff_then_dead_letters() {
        let store = InMemoryJobStore::new();
        let policy = RetryPolicy::exponential(2, Duration::ZERO);
        let job_id = store.enqueue(job().with_retry_policy(policy)).await.unwrap();

        let claimed = store.claim_next("test", LEASE).await.unwrap().job.unwrap();
        let failed = store.fail(job_id, claimed.attempt, "boom").await.unwrap();
        assert!(matches!(failed.status, JobStatus::Failed { attempt: 1, .. }));

        let claimed = store.claim_next("test", LEASE).await.unwrap().job.unwrap();
        assert_eq!(claimed.attempt, 2);
        let failed = store.fail(job_id, claimed.attempt, "boom again").await.unwrap();
        assert!(matches!(failed.status, JobStatus::DeadLettered { attempts: 2, .. }));

        // Never redelivered
        assert!(store.claim_next("test", LEASE).await.unwrap().job.is_none());

        // Still readable for the exhaustion listener
        let dead = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(dead.last_error(), Some("boom again"));
        assert_eq!(store.stats("test").await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn backoff_delays_redelivery() {
        let store = InMemoryJobStore::new();
        let policy = RetryPolicy::exponential(3, Duration::from_secs(60));
        let job_id = store.enqueue(job().with_retry_policy(policy)).await.unwrap();

        let claimed = store.claim_next("test", LEASE).await.unwrap().job.unwrap();
        store.fail(job_id, claimed.attempt, "boom").await.unwrap();

        assert!(store.claim_next("test", LEASE).await.unwrap().job.is_none());
    }

    #[tokio::test]
    async fn stale_delivery_cannot_report() {
        let store = InMemoryJobStore::new();
        let job_id = store.enqueue(job()).await.unwrap();

        let claimed = store.claim_next("test", Duration::ZERO).await.unwrap().job.unwrap();
        // Lease already expired: another worker picks it up.
        let reclaimed = store.claim_next("test", LEASE).await.unwrap().job.unwrap();
        assert_eq!(reclaimed.attempt, claimed.attempt + 1);

        let err = store.complete(job_id, claimed.attempt).await.unwrap_err();
        assert!(matches!(err, JobStoreError::LeaseLost(_)));
        store.complete(job_id, reclaimed.attempt).await.unwrap();
    }

    #[tokio::test]
    async fn stalled_final_attempt_is_dead_lettered() {
        let store = InMemoryJobStore::new();
        let job_id = store
            .enqueue(job().with_retry_policy(RetryPolicy::no_retry()))
            .await
            .unwrap();

        store.claim_next("test", Duration::ZERO).await.unwrap().job.unwrap();
        let claim = store.claim_next("test", LEASE).await.unwrap();
        assert!(claim.job.is_none());
        assert_eq!(claim.stalled_out.len(), 1);
        assert_eq!(claim.stalled_out[0].id, job_id);

        let job = store.get(job_id).await.unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 1, .. }));
        assert_eq!(job.last_error(), Some(STALLED_OUT_ERROR));
    }

    #[tokio::test]
    async fn stalled_retry_is_dead_lettered_with_previous_error() {
        let store = InMemoryJobStore::new();
        let policy = RetryPolicy::exponential(2, Duration::ZERO);
        let job_id = store.enqueue(job().with_retry_policy(policy)).await.unwrap();

        let claimed = store.claim_next("test", LEASE).await.unwrap().job.unwrap();
        store.fail(job_id, claimed.attempt, "Vendor timeout").await.unwrap();
        store.claim_next("test", Duration::ZERO).await.unwrap().job.unwrap();

        let claim = store.claim_next("test", LEASE).await.unwrap();
        assert!(claim.job.is_none());
        assert_eq!(claim.stalled_out[0].last_error(), Some("Vendor timeout"));
    }

    #[tokio::test]
    async fn released_job_is_redelivered_with_same_attempt() {
        let store = InMemoryJobStore::new();
        let job_id = store.enqueue(job()).await.unwrap();

        let claimed = store.claim_next("test", LEASE).await.unwrap().job.unwrap();
        store.release(job_id, claimed.attempt).await.unwrap();

        let again = store.claim_next("test", LEASE).await.unwrap().job.unwrap();
        assert_eq!(again.id, job_id);
        assert_eq!(again.attempt, 1);
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();

        for i in 0..5 {
            store
                .enqueue(Job::new("test", serde_json::json!({ "i": i })))
                .await
                .unwrap();
        }

        let stats = store.stats("test").await.unwrap();
        assert_eq!(stats.pending, 5);

        store.claim_next("test", LEASE).await.unwrap();
        store.claim_next("test", LEASE).await.unwrap();

        let stats = store.stats("test").await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);
    }
}
