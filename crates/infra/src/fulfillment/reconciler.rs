use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::listener::finalize_failed;
use super::{BookingService, BookingServiceError, TaskHandle};
use crate::bookings::BookingStore;
use crate::jobs::{JobQueue, JobStatus, JobStoreError};

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Stale `PENDING` bookings examined
    pub scanned: usize,
    /// Bookings that had no job and were enqueued again
    pub requeued: usize,
    /// Bookings whose job was dead-lettered, now marked `FAILED`
    pub finalized: usize,
    /// Bookings whose job is still pending, running or awaiting retry
    pub in_flight: usize,
    /// Bookings that could not be examined this time
    pub errors: usize,
}

/// Periodic sweep for `PENDING` bookings that nothing will move any more.
///
/// Two gaps leave a booking stranded: the job was never enqueued (intake
/// reported `EnqueueFailure`), or the exhaustion event was lost. The sweep
/// repairs both: a missing job is enqueued, a dead-lettered one finalizes the
/// booking as `FAILED`.
#[derive(Clone)]
pub struct PendingReconciler {
    service: BookingService,
    bookings: Arc<dyn BookingStore>,
    queue: JobQueue,
    stale_after: Duration,
    batch_size: usize,
}

impl PendingReconciler {
    pub fn new(
        service: BookingService,
        bookings: Arc<dyn BookingStore>,
        queue: JobQueue,
        stale_after: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            service,
            bookings,
            queue,
            stale_after,
            batch_size: batch_size.max(1),
        }
    }

    /// Run one sweep over bookings that have been `PENDING` for at least `stale_after`.
    pub async fn run_once(&self) -> Result<ReconcileReport, BookingServiceError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.stale_after).unwrap_or_default();
        let stale = self
            .bookings
            .list_pending_created_before(cutoff, self.batch_size)
            .await?;

        let mut report = ReconcileReport {
            scanned: stale.len(),
            ..Default::default()
        };

        for booking in stale {
            let key = booking.id.job_dedupe_key();
            let job = match self.queue.find_by_dedupe_key(&key).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(booking_id = %booking.id, error = %e, "failed to look up fulfillment job");
                    report.errors += 1;
                    continue;
                }
            };

            match job {
                None => match self.service.enqueue_fulfillment(booking.id).await {
                    Ok(job_id) => {
                        info!(booking_id = %booking.id, %job_id, "requeued booking with no fulfillment job");
                        report.requeued += 1;
                    }
                    // Enqueued concurrently by someone else.
                    Err(JobStoreError::AlreadyExists(_)) => report.in_flight += 1,
                    Err(e) => {
                        warn!(booking_id = %booking.id, error = %e, "failed to requeue booking");
                        report.errors += 1;
                    }
                },
                Some(job) if matches!(job.status, JobStatus::DeadLettered { .. }) => {
                    let final_error = job.last_error().unwrap_or("fulfillment job dead-lettered");
                    match finalize_failed(
                        self.bookings.as_ref(),
                        booking.id,
                        job.retry_policy.max_attempts,
                        final_error,
                    )
                    .await
                    {
                        Ok(Some(_)) => report.finalized += 1,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(booking_id = %booking.id, error = %e, "failed to finalize booking");
                            report.errors += 1;
                        }
                    }
                }
                Some(job) => {
                    if matches!(job.status, JobStatus::Completed) {
                        // Only reachable if the confirming write was lost after the job completed.
                        warn!(booking_id = %booking.id, job_id = %job.id, "booking pending after its job completed");
                    }
                    report.in_flight += 1;
                }
            }
        }

        debug!(?report, "reconciliation sweep finished");
        Ok(report)
    }

    /// Sweep every `interval` until shutdown.
    pub fn spawn(self, interval: Duration) -> TaskHandle {
        TaskHandle::spawn("pending-reconciler", move |shutdown| self.run(interval, shutdown))
    }

    async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "pending reconciler started");
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.requeued + report.finalized > 0 => {
                            info!(requeued = report.requeued, finalized = report.finalized, "reconciled stale bookings");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "reconciliation sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("pending reconciler stopped");
    }
}

impl std::fmt::Debug for PendingReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReconciler")
            .field("stale_after", &self.stale_after)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}
