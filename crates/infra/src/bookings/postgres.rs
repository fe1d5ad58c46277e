//! Postgres-backed booking store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | BookingStoreError |
//! |------------|----------------------|-------------------|
//! | Database (unique violation on `idempotency_key`) | `23505` | `DuplicateKey` |
//! | Database (other) | Any other | `Unavailable` |
//! | PoolClosed / network / decode | N/A | `Unavailable` |
//!
//! ## Terminal states
//!
//! Status transitions are conditional writes (`... WHERE status = 'pending'`),
//! so two workers racing on the same booking cannot both win.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use reservo_core::{Booking, BookingId, BookingStatus, NewBooking, PageRequest, StatusUpdate};

use super::{BookingStore, BookingStoreError};

const BOOKING_COLUMNS: &str = r#"
    id,
    idempotency_key,
    status,
    vendor_booking_id,
    guest_name,
    guest_email,
    check_in,
    check_out,
    room_type,
    failure_reason,
    retry_count,
    created_at,
    updated_at
"#;

/// Postgres-backed booking store.
#[derive(Debug, Clone)]
pub struct PostgresBookingStore {
    pool: PgPool,
}

impl PostgresBookingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_optional(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<Booking>, BookingStoreError> {
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        row.map(|row| decode_booking(&row)).transpose()
    }
}

#[async_trait]
impl BookingStore for PostgresBookingStore {
    #[instrument(skip(self, new), fields(idempotency_key = %new.idempotency_key), err)]
    async fn create(&self, new: NewBooking) -> Result<Booking, BookingStoreError> {
        let sql = format!(
            r#"
            INSERT INTO bookings (
                idempotency_key,
                guest_name,
                guest_email,
                check_in,
                check_out,
                room_type
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {BOOKING_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(&new.idempotency_key)
            .bind(&new.guest_name)
            .bind(&new.guest_email)
            .bind(new.check_in)
            .bind(new.check_out)
            .bind(&new.room_type)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    BookingStoreError::DuplicateKey(new.idempotency_key.clone())
                } else {
                    map_sqlx_error("create_booking", e)
                }
            })?;

        decode_booking(&row)
    }

    #[instrument(skip(self), fields(booking_id = %id), err)]
    async fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>, BookingStoreError> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
        self.fetch_optional("find_by_id", sqlx::query(&sql).bind(id.get()))
            .await
    }

    #[instrument(skip(self), err)]
    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Booking>, BookingStoreError> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE idempotency_key = $1");
        self.fetch_optional("find_by_idempotency_key", sqlx::query(&sql).bind(key))
            .await
    }

    #[instrument(skip(self), fields(page = request.page(), limit = request.limit()), err)]
    async fn list_page(
        &self,
        request: PageRequest,
    ) -> Result<(Vec<Booking>, u64), BookingStoreError> {
        let sql = format!(
            r#"
            SELECT {BOOKING_COLUMNS}
            FROM bookings
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(request.limit() as i64)
            .bind(request.offset() as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_page", e))?;

        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM bookings")
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(|e| map_sqlx_error("count_bookings", e))?;

        let items = rows
            .iter()
            .map(decode_booking)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((items, total.max(0) as u64))
    }

    #[instrument(skip(self, update), fields(booking_id = %id, status = %update.target_status()), err)]
    async fn update_status(
        &self,
        id: BookingId,
        update: StatusUpdate,
    ) -> Result<bool, BookingStoreError> {
        let (vendor_booking_id, failure_reason) = match &update {
            StatusUpdate::Confirmed { vendor_booking_id } => (Some(vendor_booking_id.as_str()), None),
            StatusUpdate::Failed { failure_reason } => (None, Some(failure_reason.as_str())),
        };

        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET status = $2,
                vendor_booking_id = $3,
                failure_reason = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.get())
        .bind(update.target_status().as_str())
        .bind(vendor_booking_id)
        .bind(failure_reason)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(booking_id = %id), err)]
    async fn increment_retry_count(&self, id: BookingId) -> Result<bool, BookingStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bookings
            SET retry_count = retry_count + 1,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_retry_count", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn list_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, BookingStoreError> {
        let sql = format!(
            r#"
            SELECT {BOOKING_COLUMNS}
            FROM bookings
            WHERE status = 'pending' AND created_at <= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_pending_created_before", e))?;

        rows.iter().map(decode_booking).collect()
    }
}

fn decode_booking(row: &sqlx::postgres::PgRow) -> Result<Booking, BookingStoreError> {
    let row = BookingRow::from_row(row)
        .map_err(|e| BookingStoreError::Unavailable(format!("failed to decode booking row: {e}")))?;
    row.try_into()
}

/// Map SQLx errors to BookingStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> BookingStoreError {
    match err {
        sqlx::Error::Database(db_err) => BookingStoreError::Unavailable(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            BookingStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => BookingStoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct BookingRow {
    id: i64,
    idempotency_key: String,
    status: String,
    vendor_booking_id: Option<String>,
    guest_name: String,
    guest_email: String,
    check_in: NaiveDate,
    check_out: NaiveDate,
    room_type: String,
    failure_reason: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BookingRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(BookingRow {
            id: row.try_get("id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: row.try_get("status")?,
            vendor_booking_id: row.try_get("vendor_booking_id")?,
            guest_name: row.try_get("guest_name")?,
            guest_email: row.try_get("guest_email")?,
            check_in: row.try_get("check_in")?,
            check_out: row.try_get("check_out")?,
            room_type: row.try_get("room_type")?,
            failure_reason: row.try_get("failure_reason")?,
            retry_count: row.try_get("retry_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<BookingRow> for Booking {
    type Error = BookingStoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status: BookingStatus = row
            .status
            .parse()
            .map_err(|e| BookingStoreError::Unavailable(format!("corrupt booking row {}: {e}", row.id)))?;

        Ok(Booking {
            id: BookingId::new(row.id),
            idempotency_key: row.idempotency_key,
            status,
            vendor_booking_id: row.vendor_booking_id,
            guest_name: row.guest_name,
            guest_email: row.guest_email,
            check_in: row.check_in,
            check_out: row.check_out,
            room_type: row.room_type,
            failure_reason: row.failure_reason,
            retry_count: row.retry_count.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
