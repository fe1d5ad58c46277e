//! Background job system with retry, backoff, and dead-letter handling.
//!
//! ## Design
//!
//! - Delivery is at-least-once; a claimed job is leased to one worker
//! - A job whose lease expires is redelivered (or dead-lettered, and reported
//!   as failed, on its final attempt)
//! - Failed deliveries are retried with exponential backoff
//! - Jobs are dead-lettered after `max_attempts` deliveries
//! - An optional dedupe key keeps at most one job per key
//!
//! ## Components
//!
//! - `Job`: Core job abstraction with payload and metadata
//! - `JobStore`: Persistence for jobs (in-memory or Postgres)
//! - `JobQueue`: Enqueue facade plus the outcome event stream
//! - `JobExecutor`: Worker tasks that run handlers

pub mod events;
pub mod executor;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;

pub use events::{JobEvent, JobEventBus, Subscription};
pub use executor::{
    DeliveryOutcome, ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler,
};
pub use postgres::PostgresJobStore;
pub use queue::{EnqueueOptions, JobQueue};
pub use store::{Claim, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{Job, JobAttemptRecord, JobId, JobResult, JobStatus, RetryPolicy, STALLED_OUT_ERROR};
