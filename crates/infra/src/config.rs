//! Pipeline configuration.
//!
//! Loaded from environment variables with defaults. Durations are given in
//! milliseconds.

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::jobs::{JobExecutorConfig, RetryPolicy};

/// Minimum ratio of the job lease to the slowest vendor call.
const LEASE_TO_VENDOR_DELAY: u32 = 2;

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    pub vendor: VendorConfig,
    pub worker: WorkerConfig,
    pub reconcile: ReconcileConfig,
}

/// Job retry policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryConfig {
    /// Total deliveries per job (default: 5)
    pub max_attempts: u32,
    /// Backoff after the first failed attempt (default: 1000ms)
    pub base_delay: Duration,
    /// Backoff ceiling (default: 60000ms)
    pub max_delay: Duration,
}

/// Simulated vendor behaviour.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorConfig {
    /// Probability that a call fails (default: 0.3)
    pub failure_rate: f64,
    /// Lower latency bound (default: 100ms)
    pub min_delay: Duration,
    /// Upper latency bound (default: 2000ms)
    pub max_delay: Duration,
}

/// Fulfillment worker pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerConfig {
    /// Concurrent worker tasks (default: 4)
    pub concurrency: usize,
    /// Idle poll interval (default: 100ms)
    pub poll_interval: Duration,
    /// How long a claimed job stays owned before it is redelivered (default: 30000ms)
    pub lease: Duration,
}

/// Stale-booking sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileConfig {
    /// Time between sweeps (default: 30000ms)
    pub interval: Duration,
    /// Minimum age of a `PENDING` booking before the sweep looks at it (default: 60000ms)
    pub stale_after: Duration,
    /// Bookings examined per sweep (default: 100)
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(1000),
                max_delay: Duration::from_millis(60_000),
            },
            vendor: VendorConfig {
                failure_rate: 0.3,
                min_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(2000),
            },
            worker: WorkerConfig {
                concurrency: 4,
                poll_interval: Duration::from_millis(100),
                lease: Duration::from_millis(30_000),
            },
            reconcile: ReconcileConfig {
                interval: Duration::from_millis(30_000),
                stale_after: Duration::from_millis(60_000),
                batch_size: 100,
            },
        }
    }
}

impl PipelineConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup (unset keys use defaults).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let env = Env { lookup: &lookup };

        let retry = RetryConfig {
            max_attempts: env.parse("MAX_RETRY_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: env.millis("RETRY_DELAY_MS", defaults.retry.base_delay)?,
            max_delay: env.millis("RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
        };
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid("MAX_RETRY_ATTEMPTS", "0", "must be at least 1"));
        }

        let vendor = VendorConfig {
            failure_rate: env.parse("VENDOR_FAILURE_RATE", defaults.vendor.failure_rate)?,
            min_delay: env.millis("VENDOR_MIN_DELAY_MS", defaults.vendor.min_delay)?,
            max_delay: env.millis("VENDOR_MAX_DELAY_MS", defaults.vendor.max_delay)?,
        };
        if !(0.0..=1.0).contains(&vendor.failure_rate) {
            return Err(ConfigError::invalid(
                "VENDOR_FAILURE_RATE",
                vendor.failure_rate.to_string(),
                "must be between 0 and 1",
            ));
        }
        if vendor.max_delay < vendor.min_delay {
            return Err(ConfigError::invalid(
                "VENDOR_MAX_DELAY_MS",
                vendor.max_delay.as_millis().to_string(),
                "must not be below VENDOR_MIN_DELAY_MS",
            ));
        }

        let worker = WorkerConfig {
            concurrency: env.parse("WORKER_CONCURRENCY", defaults.worker.concurrency)?,
            poll_interval: env.millis("WORKER_POLL_INTERVAL_MS", defaults.worker.poll_interval)?,
            lease: env.millis("JOB_LEASE_MS", defaults.worker.lease)?,
        };
        if worker.concurrency == 0 {
            return Err(ConfigError::invalid("WORKER_CONCURRENCY", "0", "must be at least 1"));
        }
        // An expired lease hands the job to another worker, so it must outlast any vendor call.
        if worker.lease <= vendor.max_delay.saturating_mul(LEASE_TO_VENDOR_DELAY) {
            return Err(ConfigError::invalid(
                "JOB_LEASE_MS",
                worker.lease.as_millis().to_string(),
                format!(
                    "must exceed {LEASE_TO_VENDOR_DELAY}x VENDOR_MAX_DELAY_MS ({}ms)",
                    vendor.max_delay.as_millis()
                ),
            ));
        }

        let reconcile = ReconcileConfig {
            interval: env.millis("RECONCILE_INTERVAL_MS", defaults.reconcile.interval)?,
            stale_after: env.millis("RECONCILE_STALE_AFTER_MS", defaults.reconcile.stale_after)?,
            batch_size: defaults.reconcile.batch_size,
        };

        Ok(Self {
            retry,
            vendor,
            worker,
            reconcile,
        })
    }

    /// Retry policy applied to every fulfillment job.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.retry.max_attempts, self.retry.base_delay)
            .with_max_delay(self.retry.max_delay)
    }

    pub fn executor_config(&self) -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_name("booking-fulfillment")
            .with_concurrency(self.worker.concurrency)
            .with_poll_interval(self.worker.poll_interval)
            .with_lease(self.worker.lease)
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn parse<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(key) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(key, raw, "not a valid number")),
            _ => Ok(default),
        }
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let ms: u64 = self.parse(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }
}
