//! `reservo-core`: booking domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod booking;
pub mod error;
pub mod id;
pub mod pagination;

pub use booking::{Booking, BookingStatus, NewBooking, StatusUpdate};
pub use error::{DomainError, DomainResult};
pub use id::BookingId;
pub use pagination::{Page, PageMeta, PageRequest};
