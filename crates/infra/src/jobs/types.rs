//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recorded when a job stalls on its final delivery with no earlier error.
pub const STALLED_OUT_ERROR: &str = "job lease expired on final attempt";

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Claimed by a worker (owned until `lease_until`)
    Running,
    /// Completed successfully
    Completed,
    /// Failed, will be redelivered once the backoff elapses
    Failed { error: String, attempt: u32 },
    /// Exhausted all attempts; never redelivered
    DeadLettered { error: String, attempts: u32 },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered { .. })
    }

    /// Stable name used for persistence and stats.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed { .. } => "failed",
            JobStatus::DeadLettered { .. } => "dead_lettered",
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobStatus::Failed { error, .. } | JobStatus::DeadLettered { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Retry policy configuration (exponential backoff).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of deliveries allowed, first attempt included
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Growth factor applied per further failed attempt
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries (a single delivery).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff (multiplier 2).
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Calculate the redelivery delay after a failed attempt (1-indexed).
    ///
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = self.multiplier.max(1.0).powi((attempt - 1) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Check if another delivery is allowed after `attempt` deliveries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether `attempt` deliveries have used up the policy.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        !self.should_retry(attempt)
    }
}

/// A queued job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Queue the job belongs to (routes to a handler)
    pub queue: String,
    /// JSON payload
    pub payload: serde_json::Value,
    /// At most one job may ever exist per dedupe key
    pub dedupe_key: Option<String>,
    /// Current status
    pub status: JobStatus,
    /// Retry policy
    pub retry_policy: RetryPolicy,
    /// Deliveries made so far (starts at 0)
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time of the next delivery (backoff)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Ownership deadline of the current delivery
    pub lease_until: Option<DateTime<Utc>>,
    /// Start of the current delivery
    pub started_at: Option<DateTime<Utc>>,
    /// Execution history (one record per finished attempt)
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Job {
    /// Create a new job.
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            dedupe_key: None,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            lease_until: None,
            started_at: None,
            history: Vec::new(),
        }
    }

    /// Set a custom retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Attach a dedupe key.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Check if the job can be claimed at `now`.
    ///
    /// Pending jobs are always ready, failed jobs once their backoff elapsed,
    /// running jobs once their lease expired (the owner is presumed dead).
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending | JobStatus::Failed { .. } => {
                self.scheduled_at.is_none_or(|at| now >= at)
            }
            JobStatus::Running => self.is_stalled(now),
            JobStatus::Completed | JobStatus::DeadLettered { .. } => false,
        }
    }

    /// A running job whose lease has expired.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Running) && self.lease_until.is_some_and(|until| now >= until)
    }

    /// Mark job as running (one more delivery).
    pub fn mark_running(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.started_at = Some(now);
        self.lease_until = Some(now + to_chrono(lease));
        self.scheduled_at = None;
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.record_attempt(now, None);
        self.status = JobStatus::Completed;
        self.lease_until = None;
        self.updated_at = now;
    }

    /// Mark job as failed: schedule a backoff redelivery or dead-letter it.
    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.record_attempt(now, Some(error.clone()));
        self.lease_until = None;
        self.updated_at = now;

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + to_chrono(delay));
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.scheduled_at = None;
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    /// Dead-letter a job that stalled on its final delivery.
    ///
    /// The dead-letter error is the last one a delivery actually reported.
    pub fn mark_stalled_out(&mut self, now: DateTime<Utc>) {
        let error = self
            .history
            .iter()
            .rev()
            .find_map(|h| h.error.clone())
            .unwrap_or_else(|| STALLED_OUT_ERROR.to_string());
        self.mark_failed(error, now);
    }

    /// Hand an in-flight delivery back to the queue without consuming an attempt.
    pub fn mark_released(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempt = self.attempt.saturating_sub(1);
        self.started_at = None;
        self.lease_until = None;
        self.scheduled_at = None;
        self.updated_at = now;
    }

    /// Whether the caller still owns delivery `attempt` of this job.
    pub fn is_owned_by(&self, attempt: u32) -> bool {
        matches!(self.status, JobStatus::Running) && self.attempt == attempt
    }

    /// Error message of the most recent failed attempt.
    pub fn last_error(&self) -> Option<&str> {
        self.status
            .error()
            .or_else(|| self.history.iter().rev().find_map(|h| h.error.as_deref()))
    }

    fn record_attempt(&mut self, now: DateTime<Utc>, error: Option<String>) {
        let started_at = self.started_at.take().unwrap_or(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_default()
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed with an error (the retry policy decides what happens next)
    Failure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::exponential(10, Duration::from_millis(1000))
            .with_max_delay(Duration::from_secs(3));

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(3));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new("test", serde_json::json!({"key": "value"}));

        assert!(matches!(job.status, JobStatus::Pending));
        assert_eq!(job.attempt, 0);
        assert!(job.is_ready(Utc::now()));

        let now = Utc::now();
        job.mark_running(now, Duration::from_secs(30));
        assert!(matches!(job.status, JobStatus::Running));
        assert_eq!(job.attempt, 1);
        assert!(!job.is_ready(now));
        assert!(job.is_owned_by(1));

        job.mark_completed(Utc::now());
        assert!(matches!(job.status, JobStatus::Completed));
        assert_eq!(job.history.len(), 1);
        assert!(job.history[0].success);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn job_failure_and_retry() {
        let mut job = Job::new("test", serde_json::json!({}))
            .with_retry_policy(RetryPolicy::exponential(2, Duration::from_millis(500)));

        let now = Utc::now();
        job.mark_running(now, Duration::from_secs(30));
        job.mark_failed("error 1".to_string(), now);

        assert!(matches!(job.status, JobStatus::Failed { attempt: 1, .. }));
        assert_eq!(job.scheduled_at, Some(now + chrono::Duration::milliseconds(500)));
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::milliseconds(500)));

        job.mark_running(now, Duration::from_secs(30));
        job.mark_failed("error 2".to_string(), now);

        assert!(matches!(job.status, JobStatus::DeadLettered { attempts: 2, .. }));
        assert_eq!(job.last_error(), Some("error 2"));
        assert!(!job.is_ready(now + chrono::Duration::days(1)));
    }

    #[test]
    fn release_gives_back_the_attempt() {
        let mut job = Job::new("test", serde_json::json!({}));
        let now = Utc::now();
        job.mark_running(now, Duration::from_secs(30));
        job.mark_released(now);

        assert!(matches!(job.status, JobStatus::Pending));
        assert_eq!(job.attempt, 0);
        assert!(job.history.is_empty());
    }

    #[test]
    fn expired_lease_makes_job_claimable_again() {
        let mut job = Job::new("test", serde_json::json!({}));
        let now = Utc::now();
        job.mark_running(now, Duration::from_millis(10));

        assert!(!job.is_stalled(now));
        assert!(job.is_stalled(now + chrono::Duration::milliseconds(10)));
        assert!(job.is_ready(now + chrono::Duration::milliseconds(10)));
    }

    #[test]
    fn stalled_out_keeps_last_reported_error() {
        let mut job = Job::new("test", serde_json::json!({}))
            .with_retry_policy(RetryPolicy::exponential(2, Duration::ZERO));
        let now = Utc::now();

        job.mark_running(now, Duration::from_secs(30));
        job.mark_failed("Vendor timeout".to_string(), now);
        job.mark_running(now, Duration::ZERO);
        job.mark_stalled_out(now);

        assert_eq!(
            job.status,
            JobStatus::DeadLettered {
                error: "Vendor timeout".into(),
                attempts: 2
            }
        );

        let mut single = Job::new("test", serde_json::json!({}))
            .with_retry_policy(RetryPolicy::no_retry());
        single.mark_running(now, Duration::ZERO);
        single.mark_stalled_out(now);
        assert_eq!(single.last_error(), Some(STALLED_OUT_ERROR));
    }
}
