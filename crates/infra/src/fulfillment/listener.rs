use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use reservo_core::{BookingId, StatusUpdate};

use super::{BOOKING_QUEUE, FulfillmentJob, TaskHandle};
use crate::bookings::BookingStore;
use crate::fulfillment::BookingServiceError;
use crate::jobs::{JobEvent, JobId, JobQueue, JobStatus, Subscription};

/// Finalizes bookings whose fulfillment job ran out of attempts.
///
/// Reacts to every `Failed` event of the booking queue but only writes when
/// the job is dead-lettered; earlier failures are left to redelivery. The
/// write is the conditional `Pending -> Failed` transition, so replays and late
/// events are no-ops.
#[derive(Clone)]
pub struct TerminalFailureListener {
    queue: JobQueue,
    bookings: Arc<dyn BookingStore>,
}

impl TerminalFailureListener {
    pub fn new(queue: JobQueue, bookings: Arc<dyn BookingStore>) -> Self {
        Self { queue, bookings }
    }

    /// Handle one job event.
    ///
    /// Returns the booking that was finalized as failed by this call, if any.
    pub async fn handle_event(
        &self,
        event: &JobEvent,
    ) -> Result<Option<BookingId>, BookingServiceError> {
        if event.queue() != BOOKING_QUEUE {
            return Ok(None);
        }

        match event {
            JobEvent::Completed { job_id, .. } => {
                info!(%job_id, "job completed");
                Ok(None)
            }
            JobEvent::Failed { job_id, error, .. } => self.on_failed(*job_id, error).await,
        }
    }

    async fn on_failed(
        &self,
        job_id: JobId,
        error: &str,
    ) -> Result<Option<BookingId>, BookingServiceError> {
        let Some(job) = self
            .queue
            .get_job(job_id)
            .await
            .map_err(|e| BookingServiceError::StoreUnavailable(e.to_string()))?
        else {
            warn!(%job_id, "failed job no longer exists");
            return Ok(None);
        };

        let Ok(FulfillmentJob { booking_id }) = serde_json::from_value::<FulfillmentJob>(job.payload.clone())
        else {
            warn!(%job_id, "failed job has a malformed payload");
            return Ok(None);
        };

        // Dead-lettered is the only state in which no further delivery can happen.
        let exhausted = matches!(job.status, JobStatus::DeadLettered { .. });
        info!(
            %booking_id,
            %job_id,
            attempt = job.attempt,
            error,
            will_retry = !exhausted,
            "job failed"
        );
        if !exhausted {
            return Ok(None);
        }

        let final_error = job.last_error().unwrap_or(error).to_string();
        finalize_failed(self.bookings.as_ref(), booking_id, job.retry_policy.max_attempts, &final_error).await
    }

    /// Consume events until shutdown, then drain what is already buffered.
    pub fn spawn(self) -> TaskHandle {
        // Subscribe before spawning so no event published after this call is missed.
        let subscription = self.queue.subscribe();
        TaskHandle::spawn("terminal-failure-listener", move |shutdown| {
            self.run(subscription, shutdown)
        })
    }

    async fn run(self, mut events: Subscription, mut shutdown: watch::Receiver<bool>) {
        info!("terminal-failure listener started");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.process(&event).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        while let Some(event) = events.try_recv() {
                            self.process(&event).await;
                        }
                        break;
                    }
                }
            }
        }
        info!("terminal-failure listener stopped");
    }

    async fn process(&self, event: &JobEvent) {
        if let Err(e) = self.handle_event(event).await {
            // The reconciler picks up bookings left behind here.
            error!(job_id = %event.job_id(), error = %e, "failed to handle job event");
        }
    }
}

/// Move a `Pending` booking to `Failed`; a no-op for terminal bookings.
pub(crate) async fn finalize_failed(
    bookings: &dyn BookingStore,
    booking_id: BookingId,
    max_attempts: u32,
    final_error: &str,
) -> Result<Option<BookingId>, BookingServiceError> {
    if bookings
        .update_status(booking_id, StatusUpdate::failed(final_error))
        .await?
    {
        error!(
            %booking_id,
            max_attempts,
            final_error,
            "booking exhausted all retry attempts"
        );
        Ok(Some(booking_id))
    } else {
        debug!(%booking_id, "booking already final, exhaustion ignored");
        Ok(None)
    }
}

impl std::fmt::Debug for TerminalFailureListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalFailureListener").finish_non_exhaustive()
    }
}
