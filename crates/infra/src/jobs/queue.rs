//! Job queue facade: a store plus the outcome event stream.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::events::{JobEvent, JobEventBus, Subscription};
use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobStatus, RetryPolicy, STALLED_OUT_ERROR};

/// Per-job enqueue options.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub retry_policy: RetryPolicy,
    pub dedupe_key: Option<String>,
}

impl EnqueueOptions {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            retry_policy,
            dedupe_key: None,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Durable, at-least-once work queue.
///
/// Cheap to clone; clones share the store and the event bus.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    events: Arc<JobEventBus>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            events: Arc::new(JobEventBus::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue `payload` on `queue`.
    pub async fn enqueue<P: Serialize>(
        &self,
        queue: &str,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<JobId, JobStoreError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| JobStoreError::InvalidPayload(e.to_string()))?;

        let mut job = Job::new(queue, payload).with_retry_policy(options.retry_policy);
        if let Some(key) = options.dedupe_key {
            job = job.with_dedupe_key(key);
        }

        let job_id = self.store.enqueue(job).await?;
        debug!(%job_id, queue, "job enqueued");
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }

    pub async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        self.store.find_by_dedupe_key(key).await
    }

    pub async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        self.store.stats(queue).await
    }

    /// Subscribe to delivery outcomes.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Claim the next delivery and publish `Failed` for any job that stalled
    /// out on the way.
    pub(crate) async fn claim_next(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<Job>, JobStoreError> {
        let claim = self.store.claim_next(queue, lease).await?;
        for job in claim.stalled_out {
            self.publish(JobEvent::Failed {
                job_id: job.id,
                error: job.last_error().unwrap_or(STALLED_OUT_ERROR).to_string(),
                queue: job.queue,
            });
        }
        Ok(claim.job)
    }

    /// Record a successful delivery and publish `Completed`.
    pub(crate) async fn report_success(&self, job: &Job) -> Result<Job, JobStoreError> {
        let updated = self.store.complete(job.id, job.attempt).await?;
        self.publish(JobEvent::Completed {
            job_id: job.id,
            queue: job.queue.clone(),
        });
        Ok(updated)
    }

    /// Record a failed delivery and publish `Failed`.
    pub(crate) async fn report_failure(&self, job: &Job, error: &str) -> Result<Job, JobStoreError> {
        let updated = self.store.fail(job.id, job.attempt, error).await?;
        if matches!(updated.status, JobStatus::DeadLettered { .. }) {
            warn!(job_id = %job.id, attempts = updated.attempt, error, "job dead-lettered");
        }
        self.publish(JobEvent::Failed {
            job_id: job.id,
            queue: job.queue.clone(),
            error: error.to_string(),
        });
        Ok(updated)
    }

    /// Hand an interrupted delivery back for redelivery.
    pub(crate) async fn release(&self, job: &Job) -> Result<(), JobStoreError> {
        self.store.release(job.id, job.attempt).await
    }

    fn publish(&self, event: JobEvent) {
        if let Err(e) = self.events.publish(event) {
            warn!(error = %e, "failed to publish job event");
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    const LEASE: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn outcomes_are_published() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let mut events = queue.subscribe();

        let options = EnqueueOptions::new(RetryPolicy::exponential(3, Duration::ZERO));
        let job_id = queue
            .enqueue("q", &serde_json::json!({ "n": 1 }), options)
            .await
            .unwrap();

        let job = queue.claim_next("q", LEASE).await.unwrap().unwrap();
        queue.report_failure(&job, "boom").await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(JobEvent::Failed {
                job_id,
                queue: "q".into(),
                error: "boom".into()
            })
        );

        let job = queue.claim_next("q", LEASE).await.unwrap().unwrap();
        queue.report_success(&job).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(JobEvent::Completed {
                job_id,
                queue: "q".into()
            })
        );
    }

    #[tokio::test]
    async fn stalled_final_delivery_publishes_failure() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let mut events = queue.subscribe();

        let options = EnqueueOptions::new(RetryPolicy::exponential(2, Duration::ZERO));
        let job_id = queue.enqueue("q", &1, options).await.unwrap();

        let job = queue.claim_next("q", LEASE).await.unwrap().unwrap();
        queue.report_failure(&job, "Vendor timeout").await.unwrap();
        events.recv().await.unwrap();

        // Final delivery whose worker never reports back.
        queue.claim_next("q", Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.claim_next("q", LEASE).await.unwrap().is_none());

        assert_eq!(
            events.recv().await,
            Some(JobEvent::Failed {
                job_id,
                queue: "q".into(),
                error: "Vendor timeout".into()
            })
        );
        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn dedupe_key_prevents_second_job() {
        let queue = JobQueue::new(InMemoryJobStore::arc());
        let options = EnqueueOptions::default().with_dedupe_key("booking:1");

        queue.enqueue("q", &1, options.clone()).await.unwrap();
        let err = queue.enqueue("q", &1, options).await.unwrap_err();
        assert!(matches!(err, JobStoreError::AlreadyExists(_)));
    }
}
