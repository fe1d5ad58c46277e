//! Infrastructure layer: booking and job persistence, the vendor client and
//! the fulfillment pipeline that ties them together.

pub mod bookings;
pub mod config;
pub mod db;
pub mod fulfillment;
pub mod jobs;
pub mod vendor;


pub use bookings::{BookingStore, BookingStoreError, InMemoryBookingStore, PostgresBookingStore};
pub use config::{ConfigError, PipelineConfig};
pub use fulfillment::{BookingService, BookingServiceError, Pipeline, PipelineHandle};
pub use jobs::{InMemoryJobStore, JobQueue, JobStore, PostgresJobStore};
pub use vendor::{SimulatedVendor, VendorClient, VendorError};
