//! Job outcome events (publish/subscribe).
//!
//! Every finished delivery is published: `Completed` once per success and
//! `Failed` once per failed attempt, whether or not the job will be retried.
//! Subscribers decide what a failure means by looking the job up.
//!
//! Fan-out is unbounded per subscriber so a slow consumer never loses an
//! exhaustion event. Delivery is best-effort in-process; consumers must be
//! idempotent.

use std::sync::Mutex;

use tokio::sync::mpsc;

use super::types::JobId;

/// Outcome of one job delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Completed { job_id: JobId, queue: String },
    Failed { job_id: JobId, queue: String, error: String },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Completed { job_id, .. } | JobEvent::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            JobEvent::Completed { queue, .. } | JobEvent::Failed { queue, .. } => queue,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobEventBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("job event bus lock poisoned")]
    Poisoned,
}

/// A subscription to the job event stream.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<JobEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.receiver.recv().await
    }

    /// Try to receive an event without waiting.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.receiver.try_recv().ok()
    }
}

/// In-process pub/sub bus for job events.
#[derive(Debug, Default)]
pub struct JobEventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>,
}

impl JobEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: JobEvent) -> Result<(), JobEventBusError> {
        let mut subs = self.subscribers.lock().map_err(|_| JobEventBusError::Poisoned)?;

        // Drop any dead subscribers while publishing.
        subs.retain(|tx| tx.send(event.clone()).is_ok());

        Ok(())
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();

        // If the lock is poisoned we still return a subscription;
        // it just won't receive messages until the process restarts.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription { receiver: rx }
    }
}
