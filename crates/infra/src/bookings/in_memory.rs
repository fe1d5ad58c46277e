use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use reservo_core::{Booking, BookingId, BookingStatus, NewBooking, PageRequest, StatusUpdate};

use super::{BookingStore, BookingStoreError};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    by_id: BTreeMap<BookingId, Booking>,
    by_key: HashMap<String, BookingId>,
}

/// In-memory booking store (single process).
///
/// Ids are assigned from a counter starting at 1, like a serial column.
#[derive(Debug, Default)]
pub struct InMemoryBookingStore {
    inner: RwLock<Inner>,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, BookingStoreError> {
        self.inner
            .read()
            .map_err(|_| BookingStoreError::Unavailable("booking store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, BookingStoreError> {
        self.inner
            .write()
            .map_err(|_| BookingStoreError::Unavailable("booking store lock poisoned".into()))
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn create(&self, new: NewBooking) -> Result<Booking, BookingStoreError> {
        let mut inner = self.write()?;

        // Checked under the write lock: this is the unique constraint.
        if inner.by_key.contains_key(&new.idempotency_key) {
            return Err(BookingStoreError::DuplicateKey(new.idempotency_key));
        }

        inner.next_id += 1;
        let id = BookingId::new(inner.next_id);
        let booking = Booking::create(id, new, Utc::now());

        inner.by_key.insert(booking.idempotency_key.clone(), id);
        inner.by_id.insert(id, booking.clone());
        Ok(booking)
    }

    async fn find_by_id(&self, id: BookingId) -> Result<Option<Booking>, BookingStoreError> {
        Ok(self.read()?.by_id.get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Booking>, BookingStoreError> {
        let inner = self.read()?;
        Ok(inner
            .by_key
            .get(key)
            .and_then(|id| inner.by_id.get(id))
            .cloned())
    }

    async fn list_page(
        &self,
        request: PageRequest,
    ) -> Result<(Vec<Booking>, u64), BookingStoreError> {
        let inner = self.read()?;

        let mut all: Vec<&Booking> = inner.by_id.values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let items = all
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.limit() as usize)
            .cloned()
            .collect();

        Ok((items, inner.by_id.len() as u64))
    }

    async fn update_status(
        &self,
        id: BookingId,
        update: StatusUpdate,
    ) -> Result<bool, BookingStoreError> {
        let mut inner = self.write()?;
        Ok(match inner.by_id.get_mut(&id) {
            Some(booking) => booking.apply(&update, Utc::now()),
            None => false,
        })
    }

    async fn increment_retry_count(&self, id: BookingId) -> Result<bool, BookingStoreError> {
        let mut inner = self.write()?;
        Ok(match inner.by_id.get_mut(&id) {
            Some(booking) => {
                booking.record_vendor_failure(Utc::now());
                true
            }
            None => false,
        })
    }

    async fn list_pending_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Booking>, BookingStoreError> {
        let inner = self.read()?;
        let mut pending: Vec<Booking> = inner
            .by_id
            .values()
            .filter(|b| b.status == BookingStatus::Pending && b.created_at <= cutoff)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn new_booking(key: &str) -> NewBooking {
        NewBooking {
            idempotency_key: key.to_string(),
            guest_name: "Ada Lovelace".into(),
            guest_email: "ada@example.com".into(),
            check_in: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2026, 3, 4).unwrap(),
            room_type: "deluxe".into(),
        }
    }

    #[tokio::test]
    async fn create_assigns_ids_and_starts_pending() {
        let store = InMemoryBookingStore::new();
        let a = store.create(new_booking("a")).await.unwrap();
        let b = store.create(new_booking("b")).await.unwrap();

        assert_eq!(a.id, BookingId::new(1));
        assert_eq!(b.id, BookingId::new(2));
        assert_eq!(a.status, BookingStatus::Pending);
        assert_eq!(a.retry_count, 0);

        let found = store.find_by_idempotency_key("b").await.unwrap().unwrap();
        assert_eq!(found.id, b.id);
        assert!(store.find_by_id(BookingId::new(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let store = InMemoryBookingStore::new();
        store.create(new_booking("k")).await.unwrap();
        let err = store.create(new_booking("k")).await.unwrap_err();
        assert!(matches!(err, BookingStoreError::DuplicateKey(k) if k == "k"));
    }

    #[tokio::test]
    async fn concurrent_creates_with_same_key_store_one_record() {
        let store = Arc::new(InMemoryBookingStore::new());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create(new_booking("same")).await })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        let (_, total) = store.list_page(PageRequest::default()).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn status_update_only_applies_to_pending() {
        let store = InMemoryBookingStore::new();
        let booking = store.create(new_booking("k")).await.unwrap();

        assert!(
            store
                .update_status(booking.id, StatusUpdate::confirmed("V-1"))
                .await
                .unwrap()
        );
        assert!(
            !store
                .update_status(booking.id, StatusUpdate::failed("late"))
                .await
                .unwrap()
        );

        let stored = store.find_by_id(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Confirmed);
        assert_eq!(stored.vendor_booking_id.as_deref(), Some("V-1"));
        assert!(stored.failure_reason.is_none());
    }

    #[tokio::test]
    async fn retry_count_increments() {
        let store = InMemoryBookingStore::new();
        let booking = store.create(new_booking("k")).await.unwrap();

        store.increment_retry_count(booking.id).await.unwrap();
        store.increment_retry_count(booking.id).await.unwrap();
        assert!(!store.increment_retry_count(BookingId::new(42)).await.unwrap());

        let stored = store.find_by_id(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
    }

    #[tokio::test]
    async fn list_page_is_newest_first() {
        let store = InMemoryBookingStore::new();
        for i in 0..25 {
            store.create(new_booking(&format!("k{i}"))).await.unwrap();
        }

        let (first, total) = store.list_page(PageRequest::new(1, 10)).await.unwrap();
        assert_eq!(total, 25);
        assert_eq!(first.len(), 10);
        assert_eq!(first[0].id, BookingId::new(25));

        let (last, _) = store.list_page(PageRequest::new(3, 10)).await.unwrap();
        assert_eq!(last.len(), 5);
        assert_eq!(last[4].id, BookingId::new(1));
    }

    #[tokio::test]
    async fn pending_sweep_skips_terminal_and_recent() {
        let store = InMemoryBookingStore::new();
        let a = store.create(new_booking("a")).await.unwrap();
        let b = store.create(new_booking("b")).await.unwrap();
        store
            .update_status(b.id, StatusUpdate::failed("boom"))
            .await
            .unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let pending = store.list_pending_created_before(cutoff, 10).await.unwrap();
        assert_eq!(pending.iter().map(|b| b.id).collect::<Vec<_>>(), vec![a.id]);

        let before_all = a.created_at - chrono::Duration::seconds(1);
        assert!(
            store
                .list_pending_created_before(before_all, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
