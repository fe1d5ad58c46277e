//! Booking persistence.
//!
//! The store is a durable keyed record store: bookings are addressed by their
//! numeric id and by their unique idempotency key. Apart from creation, a
//! booking can only be changed through two narrow mutations:
//!
//! - [`BookingStore::update_status`], a compare-and-swap on `Pending`
//! - [`BookingStore::increment_retry_count`]

mod in_memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use reservo_core::{Booking, BookingId, NewBooking, PageRequest, StatusUpdate};

pub use in_memory::InMemoryBookingStore;
pub use postgres::PostgresBookingStore;

/// Booking store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BookingStoreError {
    /// The idempotency key is already claimed by another booking.
    #[error("idempotency key already exists: {0}")]
    DuplicateKey(String),

    #[error("booking store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Persist a new `Pending` booking and assign its id.
    ///
    /// Must reject a taken idempotency key at write time with `DuplicateKey`,
    /// even when two creates race.
    async fn create(&self, new: NewBooking) -> Result<Booking, BookingStoreError>;

    async fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>, BookingStoreError>;

    async fn find_by_idempotency_key(&self, key: &str)
    -> Result<Option<Booking>, BookingStoreError>;

    /// One page of bookings, newest first, plus the total number of bookings.
    async fn list_page(&self, request: PageRequest)
    -> Result<(Vec<Booking>, u64), BookingStoreError>;

    /// Apply `update` if the booking is still `Pending`.
    ///
    /// Returns `false` (and writes nothing) when the booking is missing or
    /// already terminal.
    async fn update_status(
        &self,
        id: BookingId,
        update: StatusUpdate,
    ) -> Result<bool, BookingStoreError>;

    /// Count one failed vendor attempt. Returns `false` if the booking is missing.
    async fn increment_retry_count(&self, id: BookingId) -> Result<bool, BookingStoreError>;

    /// `Pending` bookings created at or before `cutoff`, oldest first.
    async fn list_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, BookingStoreError>;
}
