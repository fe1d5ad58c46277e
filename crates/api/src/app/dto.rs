use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use reservo_core::{Booking, BookingStatus, NewBooking, Page, PageMeta, PageRequest};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /bookings`. The idempotency key travels in a header.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    pub guest_name: String,
    pub guest_email: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub room_type: String,
}

impl CreateBookingRequest {
    pub fn into_new_booking(self, idempotency_key: String) -> NewBooking {
        NewBooking {
            idempotency_key,
            guest_name: self.guest_name.trim().to_string(),
            guest_email: self.guest_email.trim().to_string(),
            check_in: self.check_in,
            check_out: self.check_out,
            room_type: self.room_type.trim().to_string(),
        }
    }
}

/// `?page=&limit=` of `GET /bookings`.
///
/// Kept as raw strings: anything that does not parse as an integer falls back
/// to the default instead of failing the request.
#[derive(Debug, Default, Deserialize)]
pub struct ListBookingsQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl ListBookingsQuery {
    pub fn page_request(&self) -> PageRequest {
        PageRequest::new(
            parse_or(self.page.as_deref(), reservo_core::pagination::DEFAULT_PAGE),
            parse_or(self.limit.as_deref(), reservo_core::pagination::DEFAULT_LIMIT),
        )
    }
}

fn parse_or(raw: Option<&str>, default: i64) -> i64 {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResponse {
    pub id: i64,
    pub idempotency_key: String,
    pub status: BookingStatus,
    pub vendor_booking_id: Option<String>,
    pub guest_name: String,
    pub guest_email: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub room_type: String,
    pub failure_reason: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Booking> for BookingResponse {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id.get(),
            idempotency_key: b.idempotency_key,
            status: b.status,
            vendor_booking_id: b.vendor_booking_id,
            guest_name: b.guest_name,
            guest_email: b.guest_email,
            check_in: b.check_in,
            check_out: b.check_out,
            room_type: b.room_type,
            failure_reason: b.failure_reason,
            retry_count: b.retry_count,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

/// `{ "data": ... }` envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}

impl From<Page<Booking>> for ListResponse<BookingResponse> {
    fn from(page: Page<Booking>) -> Self {
        let page = page.map(BookingResponse::from);
        Self {
            data: page.items,
            meta: page.meta,
        }
    }
}
