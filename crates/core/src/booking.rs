//! Booking record and its status state machine.
//!
//! A booking starts `Pending` and moves at most once, to either `Confirmed` or
//! `Failed`. Both are terminal. The only way to move a booking is
//! [`Booking::apply`], which is a compare-and-swap on `Pending`: stores
//! implement the same guard in their conditional writes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::BookingId;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
pub const MAX_GUEST_NAME_LEN: usize = 255;
pub const MAX_GUEST_EMAIL_LEN: usize = 255;
pub const MAX_ROOM_TYPE_LEN: usize = 100;

const DEFAULT_FAILURE_REASON: &str = "vendor booking failed";

/// Booking status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Failed,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for BookingStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "failed" => Ok(BookingStatus::Failed),
            other => Err(DomainError::validation(format!("unknown booking status: {other}"))),
        }
    }
}

/// Fields supplied by the client when requesting a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    pub idempotency_key: String,
    pub guest_name: String,
    pub guest_email: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub room_type: String,
}

impl NewBooking {
    /// Validate the idempotency key alone.
    ///
    /// Checked first and separately so a missing key is rejected before any
    /// store access.
    pub fn validate_idempotency_key(key: &str) -> DomainResult<()> {
        if key.trim().is_empty() {
            return Err(DomainError::validation("idempotency key is required"));
        }
        if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(DomainError::validation(format!(
                "idempotency key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
        Ok(())
    }

    /// Validate every field.
    pub fn validate(&self) -> DomainResult<()> {
        Self::validate_idempotency_key(&self.idempotency_key)?;

        require_text("guestName", &self.guest_name, MAX_GUEST_NAME_LEN)?;
        require_text("guestEmail", &self.guest_email, MAX_GUEST_EMAIL_LEN)?;
        require_text("roomType", &self.room_type, MAX_ROOM_TYPE_LEN)?;

        if !looks_like_email(&self.guest_email) {
            return Err(DomainError::validation("guestEmail must be a valid email address"));
        }
        if self.check_in >= self.check_out {
            return Err(DomainError::validation("checkIn must be before checkOut"));
        }
        Ok(())
    }
}

fn require_text(field: &str, value: &str, max_len: usize) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max_len {
        return Err(DomainError::validation(format!(
            "{field} must be at most {max_len} characters"
        )));
    }
    Ok(())
}

fn looks_like_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// The two permitted status transitions, each carrying its side field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusUpdate {
    Confirmed { vendor_booking_id: String },
    Failed { failure_reason: String },
}

impl StatusUpdate {
    pub fn confirmed(vendor_booking_id: impl Into<String>) -> Self {
        Self::Confirmed {
            vendor_booking_id: vendor_booking_id.into(),
        }
    }

    /// Build a failure transition. An empty reason is replaced so that a failed
    /// booking always explains itself.
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let failure_reason = if reason.trim().is_empty() {
            DEFAULT_FAILURE_REASON.to_string()
        } else {
            reason
        };
        Self::Failed { failure_reason }
    }

    pub fn target_status(&self) -> BookingStatus {
        match self {
            StatusUpdate::Confirmed { .. } => BookingStatus::Confirmed,
            StatusUpdate::Failed { .. } => BookingStatus::Failed,
        }
    }
}

/// A booking record as persisted by the booking store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub idempotency_key: String,
    pub status: BookingStatus,
    pub vendor_booking_id: Option<String>,
    pub guest_name: String,
    pub guest_email: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub room_type: String,
    pub failure_reason: Option<String>,
    /// Vendor failures observed for this booking (not queue deliveries).
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// Materialize a freshly created, `Pending` booking.
    pub fn create(id: BookingId, new: NewBooking, now: DateTime<Utc>) -> Self {
        Self {
            id,
            idempotency_key: new.idempotency_key,
            status: BookingStatus::Pending,
            vendor_booking_id: None,
            guest_name: new.guest_name,
            guest_email: new.guest_email,
            check_in: new.check_in,
            check_out: new.check_out,
            room_type: new.room_type,
            failure_reason: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status transition if, and only if, the booking is still `Pending`.
    ///
    /// Returns `true` when the transition was applied. A terminal booking is
    /// left untouched and `false` is returned.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> bool {
        if self.status != BookingStatus::Pending {
            return false;
        }

        match update {
            StatusUpdate::Confirmed { vendor_booking_id } => {
                self.status = BookingStatus::Confirmed;
                self.vendor_booking_id = Some(vendor_booking_id.clone());
            }
            StatusUpdate::Failed { failure_reason } => {
                self.status = BookingStatus::Failed;
                self.failure_reason = Some(failure_reason.clone());
            }
        }
        self.updated_at = now;
        true
    }

    /// Record one failed vendor attempt.
    pub fn record_vendor_failure(&mut self, now: DateTime<Utc>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.updated_at = now;
    }

    /// Check the status/side-field invariants.
    pub fn check_invariants(&self) -> DomainResult<()> {
        match self.status {
            BookingStatus::Pending => {
                if self.vendor_booking_id.is_some() || self.failure_reason.is_some() {
                    return Err(DomainError::invariant(
                        "pending booking must not carry a vendor id or failure reason",
                    ));
                }
            }
            BookingStatus::Confirmed => {
                if self.vendor_booking_id.is_none() {
                    return Err(DomainError::invariant("confirmed booking requires a vendor id"));
                }
            }
            BookingStatus::Failed => {
                if self.failure_reason.is_none() {
                    return Err(DomainError::invariant("failed booking requires a failure reason"));
                }
            }
        }
        Ok(())
    }
}
