use std::sync::Arc;

use tracing::{error, info, instrument};

use reservo_core::{Booking, BookingId, DomainError, NewBooking, Page, PageRequest};

use super::{BOOKING_QUEUE, FulfillmentJob};
use crate::bookings::{BookingStore, BookingStoreError};
use crate::jobs::{EnqueueOptions, JobId, JobQueue, JobStoreError, RetryPolicy};

/// Errors surfaced to callers of the booking service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BookingServiceError {
    /// Rejected before any mutation.
    #[error("{0}")]
    InvalidRequest(String),

    /// The idempotency key is already claimed; nothing was written.
    #[error("Booking with idempotency key {0:?} already exists")]
    Conflict(String),

    #[error("Booking with ID {0} not found")]
    NotFound(BookingId),

    /// The booking was stored but its fulfillment job was not.
    #[error("booking {booking_id} was created but could not be queued: {reason}")]
    EnqueueFailure { booking_id: BookingId, reason: String },

    #[error("booking store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<BookingStoreError> for BookingServiceError {
    fn from(err: BookingStoreError) -> Self {
        match err {
            BookingStoreError::DuplicateKey(key) => BookingServiceError::Conflict(key),
            BookingStoreError::Unavailable(msg) => BookingServiceError::StoreUnavailable(msg),
        }
    }
}

impl From<DomainError> for BookingServiceError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                BookingServiceError::InvalidRequest(msg)
            }
            other => BookingServiceError::InvalidRequest(other.to_string()),
        }
    }
}

/// Intake and read side of the pipeline.
#[derive(Clone)]
pub struct BookingService {
    bookings: Arc<dyn BookingStore>,
    queue: JobQueue,
    retry_policy: RetryPolicy,
}

impl BookingService {
    pub fn new(bookings: Arc<dyn BookingStore>, queue: JobQueue, retry_policy: RetryPolicy) -> Self {
        Self {
            bookings,
            queue,
            retry_policy,
        }
    }

    /// Create a booking and enqueue its single fulfillment job.
    ///
    /// A reused idempotency key fails with `Conflict`, whether the earlier
    /// request finished long ago or is racing this one.
    #[instrument(skip(self, new), fields(idempotency_key = %new.idempotency_key), err)]
    pub async fn create_booking(&self, new: NewBooking) -> Result<Booking, BookingServiceError> {
        NewBooking::validate_idempotency_key(&new.idempotency_key)?;
        new.validate()?;

        if self
            .bookings
            .find_by_idempotency_key(&new.idempotency_key)
            .await?
            .is_some()
        {
            return Err(BookingServiceError::Conflict(new.idempotency_key));
        }

        // The store's unique constraint settles races the lookup above misses.
        let booking = self.bookings.create(new).await?;

        match self.enqueue_fulfillment(booking.id).await {
            Ok(job_id) => {
                info!(booking_id = %booking.id, %job_id, "booking created");
                Ok(booking)
            }
            Err(e) => {
                error!(booking_id = %booking.id, error = %e, "booking created but enqueue failed");
                Err(BookingServiceError::EnqueueFailure {
                    booking_id: booking.id,
                    reason: e.to_string(),
                })
            }
        }
    }

    #[instrument(skip(self), err)]
    pub async fn get_booking(&self, id: BookingId) -> Result<Booking, BookingServiceError> {
        self.bookings
            .find_by_id(id)
            .await?
            .ok_or(BookingServiceError::NotFound(id))
    }

    /// Newest bookings first.
    pub async fn list_bookings(&self, request: PageRequest) -> Result<Page<Booking>, BookingServiceError> {
        let (items, total) = self.bookings.list_page(request).await?;
        Ok(Page::new(request, items, total))
    }

    /// Enqueue the fulfillment job of `booking_id` under its dedupe key.
    pub(crate) async fn enqueue_fulfillment(&self, booking_id: BookingId) -> Result<JobId, JobStoreError> {
        let options = EnqueueOptions::new(self.retry_policy.clone())
            .with_dedupe_key(booking_id.job_dedupe_key());
        self.queue
            .enqueue(BOOKING_QUEUE, &FulfillmentJob { booking_id }, options)
            .await
    }
}

impl std::fmt::Debug for BookingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingService")
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}
