//! Offset pagination math for listing bookings (newest first).

use serde::Serialize;

pub const DEFAULT_PAGE: i64 = 1;
pub const DEFAULT_LIMIT: i64 = 10;
pub const MAX_LIMIT: i64 = 100;

/// A clamped, 1-indexed page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    page: u64,
    limit: u64,
}

impl PageRequest {
    /// Clamp raw input: page below 1 becomes 1, limit is forced into `[1, 100]`.
    pub fn new(page: i64, limit: i64) -> Self {
        let page = page.max(1) as u64;
        let limit = limit.clamp(1, MAX_LIMIT) as u64;
        Self { page, limit }
    }

    pub fn page(&self) -> u64 {
        self.page
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Number of records skipped before this page.
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE, DEFAULT_LIMIT)
    }
}

/// Page metadata returned alongside a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    /// Records on this page.
    pub count: u64,
    /// Records overall.
    pub total: u64,
    pub page: u64,
    pub page_count: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PageMeta {
    pub fn new(request: PageRequest, count: u64, total: u64) -> Self {
        let page_count = total.div_ceil(request.limit);
        Self {
            count,
            total,
            page: request.page,
            page_count,
            has_next: request.page < page_count,
            has_prev: request.page > 1,
        }
    }
}

/// One page of items plus its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub meta: PageMeta,
}

impl<T> Page<T> {
    pub fn new(request: PageRequest, items: Vec<T>, total: u64) -> Self {
        let meta = PageMeta::new(request, items.len() as u64, total);
        Self { items, meta }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            meta: self.meta,
        }
    }
}
