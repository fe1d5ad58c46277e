use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use reservo_core::StatusUpdate;

use super::FulfillmentJob;
use crate::bookings::BookingStore;
use crate::jobs::{Job, JobHandler, JobResult};
use crate::vendor::{VendorBookingRequest, VendorClient};

/// Drives one booking toward a terminal state per job delivery.
///
/// The worker never decides that a booking has failed for good: it counts the
/// vendor failure and hands the error back to the queue. Exhaustion belongs to
/// the terminal-failure listener.
pub struct FulfillmentWorker {
    bookings: Arc<dyn BookingStore>,
    vendor: Arc<dyn VendorClient>,
}

impl FulfillmentWorker {
    pub fn new(bookings: Arc<dyn BookingStore>, vendor: Arc<dyn VendorClient>) -> Self {
        Self { bookings, vendor }
    }
}

#[async_trait]
impl JobHandler for FulfillmentWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        let payload: FulfillmentJob = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                // Redelivering an unreadable payload cannot help.
                error!(job_id = %job.id, error = %e, "malformed fulfillment job payload");
                return JobResult::Success;
            }
        };
        let booking_id = payload.booking_id;
        let attempt = job.attempt;

        info!(%booking_id, attempt, "processing booking");

        let booking = match self.bookings.find_by_id(booking_id).await {
            Ok(Some(booking)) => booking,
            Ok(None) => {
                error!(%booking_id, "booking not found");
                return JobResult::Success;
            }
            Err(e) => return JobResult::Failure(e.to_string()),
        };

        if booking.is_terminal() {
            info!(%booking_id, status = %booking.status, "booking already final, skipping vendor call");
            return JobResult::Success;
        }

        let request = VendorBookingRequest::from(&booking);
        match self.vendor.create_booking(&request).await {
            Ok(response) => {
                match self
                    .bookings
                    .update_status(booking_id, StatusUpdate::confirmed(&response.vendor_id))
                    .await
                {
                    Ok(true) => {
                        info!(%booking_id, vendor_booking_id = %response.vendor_id, "booking confirmed");
                        JobResult::Success
                    }
                    Ok(false) => {
                        warn!(
                            %booking_id,
                            vendor_booking_id = %response.vendor_id,
                            "booking already final, vendor confirmation not recorded"
                        );
                        JobResult::Success
                    }
                    // The vendor holds a reservation we could not record; a retry
                    // books again and the first successful write wins.
                    Err(e) => {
                        error!(%booking_id, vendor_booking_id = %response.vendor_id, error = %e, "failed to record confirmation");
                        JobResult::Failure(e.to_string())
                    }
                }
            }
            Err(vendor_error) => {
                error!(
                    %booking_id,
                    attempt,
                    kind = vendor_error.kind(),
                    error = %vendor_error,
                    "booking attempt failed"
                );

                match self.bookings.increment_retry_count(booking_id).await {
                    Ok(_) => JobResult::Failure(vendor_error.to_string()),
                    Err(e) => {
                        error!(%booking_id, error = %e, "failed to record retry count");
                        JobResult::Failure(format!("{vendor_error}; retry count not recorded: {e}"))
                    }
                }
            }
        }
    }
}
