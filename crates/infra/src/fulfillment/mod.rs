//! Asynchronous booking fulfillment.
//!
//! ```text
//! BookingService::create ──► BookingStore (PENDING) ──► JobQueue ("booking-processing")
//!                                                           │
//!                         FulfillmentWorker ◄───────────────┘ (1..=max_attempts deliveries)
//!                           │ vendor ok    ──► CONFIRMED
//!                           │ vendor error ──► retry_count += 1, job fails, queue backs off
//!                                                           │
//!       TerminalFailureListener ◄── JobEvent::Failed ───────┘ exhausted ──► FAILED
//!       PendingReconciler: sweeps stale PENDING bookings (missing job / missed exhaustion)
//! ```
//!
//! Every status write goes through `BookingStore::update_status`, which only
//! moves `Pending` bookings, so late or duplicate deliveries cannot overwrite a
//! terminal booking.

mod listener;
mod pipeline;
mod reconciler;
mod service;
mod worker;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

use reservo_core::BookingId;

pub use listener::TerminalFailureListener;
pub use pipeline::{Pipeline, PipelineHandle};
pub use reconciler::{PendingReconciler, ReconcileReport};
pub use service::{BookingService, BookingServiceError};
pub use worker::FulfillmentWorker;

/// Queue carrying booking fulfillment jobs.
pub const BOOKING_QUEUE: &str = "booking-processing";

/// Payload of a fulfillment job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentJob {
    pub booking_id: BookingId,
}

/// Handle to a spawned background loop.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(task(rx));
        Self {
            name,
            shutdown,
            join,
        }
    }

    /// Signal the loop to stop and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(task = self.name, error = %e, "background task panicked");
        }
    }
}
