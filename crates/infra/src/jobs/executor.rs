//! Job executor: worker tasks that claim jobs and run their handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use super::store::JobStoreError;
use super::types::{Job, JobResult, JobStatus};

/// Handler for the jobs of one queue.
///
/// A handler sees one delivery at a time; `job.attempt` is the 1-indexed number
/// of this delivery.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to poll for new jobs when idle
    pub poll_interval: Duration,
    /// Number of concurrent worker tasks
    pub concurrency: usize,
    /// How long a claimed job stays owned by its worker
    pub lease: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            concurrency: 4,
            lease: Duration::from_secs(30),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for every worker to stop.
    ///
    /// In-flight deliveries are interrupted and released back to the queue.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "job worker task panicked");
            }
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_released: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Succeeded,
    /// Failed; will be redelivered after backoff
    Failed(String),
    /// Failed on the final attempt
    DeadLettered(String),
    /// Interrupted by shutdown and handed back to the queue
    Released,
}

/// Background job executor.
///
/// Claims ready jobs from a [`JobQueue`], executes them with registered
/// handlers, and reports outcomes (the queue applies retries and
/// dead-lettering).
pub struct JobExecutor {
    queue: JobQueue,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobExecutor {
    /// Create a new executor over the given queue.
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for a queue.
    pub fn register_handler<H>(&mut self, queue: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(queue.into(), Arc::new(handler));
    }

    /// Spawn `config.concurrency` worker tasks on the current tokio runtime.
    pub fn spawn(self, config: JobExecutorConfig) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let executor = Arc::new(self);

        let joins = (0..config.concurrency.max(1))
            .map(|worker| {
                let executor = executor.clone();
                let config = config.clone();
                let shutdown_rx = shutdown_rx.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    worker_loop(executor, worker, config, shutdown_rx, stats).await;
                })
            })
            .collect();

        JobExecutorHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }

    /// Claim and execute one job of `queue` (for testing or synchronous use).
    ///
    /// Returns `None` when no job is ready.
    pub async fn run_next(
        &self,
        queue: &str,
        lease: Duration,
    ) -> Result<Option<DeliveryOutcome>, JobStoreError> {
        let (_tx, mut rx) = watch::channel(false);
        match self.queue.claim_next(queue, lease).await? {
            Some(job) => self.execute(job, &mut rx).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run one claimed delivery, racing the handler against shutdown.
    async fn execute(
        &self,
        job: Job,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DeliveryOutcome, JobStoreError> {
        let Some(handler) = self.handlers.get(&job.queue) else {
            let error = format!("no handler for queue: {}", job.queue);
            warn!(job_id = %job.id, error = %error, "no handler for job");
            let updated = self.queue.report_failure(&job, &error).await?;
            return Ok(failure_outcome(&updated, error));
        };

        let result = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => None,
            result = handler.handle(&job) => Some(result),
        };

        match result {
            None => {
                info!(job_id = %job.id, attempt = job.attempt, "delivery interrupted by shutdown, releasing job");
                self.queue.release(&job).await?;
                Ok(DeliveryOutcome::Released)
            }
            Some(JobResult::Success) => {
                self.queue.report_success(&job).await?;
                debug!(job_id = %job.id, "job completed successfully");
                Ok(DeliveryOutcome::Succeeded)
            }
            Some(JobResult::Failure(error)) => {
                let updated = self.queue.report_failure(&job, &error).await?;
                Ok(failure_outcome(&updated, error))
            }
        }
    }
}

fn failure_outcome(updated: &Job, error: String) -> DeliveryOutcome {
    if matches!(updated.status, JobStatus::DeadLettered { .. }) {
        DeliveryOutcome::DeadLettered(error)
    } else {
        DeliveryOutcome::Failed(error)
    }
}

/// Resolves once shutdown has been requested (or the handle was dropped).
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    while shutdown.changed().await.is_ok() {
        if *shutdown.borrow() {
            return;
        }
    }
}

async fn worker_loop(
    executor: Arc<JobExecutor>,
    worker: usize,
    config: JobExecutorConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, worker, "job worker started");

    let mut queues: Vec<String> = executor.handlers.keys().cloned().collect();
    queues.sort();

    while !*shutdown.borrow() {
        let mut claimed_any = false;

        for queue in &queues {
            let job = match executor.queue.claim_next(queue, config.lease).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(executor = %config.name, queue = %queue, error = %e, "failed to claim job");
                    continue;
                }
            };
            claimed_any = true;

            debug!(
                executor = %config.name,
                worker,
                job_id = %job.id,
                attempt = job.attempt,
                "claimed job"
            );
            update_stats(&stats, |s| s.current_running += 1);

            let job_id = job.id;
            let result = executor.execute(job, &mut shutdown).await;

            update_stats(&stats, |s| {
                s.current_running = s.current_running.saturating_sub(1);
                match &result {
                    Ok(DeliveryOutcome::Succeeded) => {
                        s.jobs_processed += 1;
                        s.jobs_succeeded += 1;
                    }
                    Ok(DeliveryOutcome::Failed(_)) => {
                        s.jobs_processed += 1;
                        s.jobs_failed += 1;
                    }
                    Ok(DeliveryOutcome::DeadLettered(_)) => {
                        s.jobs_processed += 1;
                        s.jobs_failed += 1;
                        s.jobs_dead_lettered += 1;
                    }
                    Ok(DeliveryOutcome::Released) => s.jobs_released += 1,
                    Err(_) => {}
                }
            });

            if let Err(e) = result {
                // The lease will expire and the job will be redelivered.
                error!(executor = %config.name, %job_id, error = %e, "failed to record job outcome");
            }

            if *shutdown.borrow() {
                break;
            }
        }

        if !claimed_any {
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    }

    info!(executor = %config.name, worker, "job worker stopped");
}

fn update_stats(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}
