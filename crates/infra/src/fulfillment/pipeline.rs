use std::sync::Arc;

use tracing::info;

use super::{
    BOOKING_QUEUE, BookingService, FulfillmentWorker, PendingReconciler, TaskHandle,
    TerminalFailureListener,
};
use crate::bookings::{BookingStore, InMemoryBookingStore};
use crate::config::PipelineConfig;
use crate::jobs::{ExecutorStats, InMemoryJobStore, JobExecutor, JobExecutorHandle, JobQueue, JobStore};
use crate::vendor::{SimulatedVendor, VendorClient};

/// The assembled fulfillment pipeline: stores, queue, vendor and the
/// background loops that connect them.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    bookings: Arc<dyn BookingStore>,
    queue: JobQueue,
    vendor: Arc<dyn VendorClient>,
    service: BookingService,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        bookings: Arc<dyn BookingStore>,
        jobs: Arc<dyn JobStore>,
        vendor: Arc<dyn VendorClient>,
    ) -> Self {
        let queue = JobQueue::new(jobs);
        let service = BookingService::new(bookings.clone(), queue.clone(), config.retry_policy());
        Self {
            config,
            bookings,
            queue,
            vendor,
            service,
        }
    }

    /// In-memory stores and a randomly failing simulated vendor, as configured.
    pub fn in_memory(config: PipelineConfig) -> Self {
        let vendor = SimulatedVendor::random(
            config.vendor.failure_rate,
            config.vendor.min_delay,
            config.vendor.max_delay,
        );
        Self::new(
            config,
            Arc::new(InMemoryBookingStore::new()),
            InMemoryJobStore::arc(),
            Arc::new(vendor),
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn service(&self) -> &BookingService {
        &self.service
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn bookings(&self) -> &Arc<dyn BookingStore> {
        &self.bookings
    }

    pub fn listener(&self) -> TerminalFailureListener {
        TerminalFailureListener::new(self.queue.clone(), self.bookings.clone())
    }

    pub fn reconciler(&self) -> PendingReconciler {
        PendingReconciler::new(
            self.service.clone(),
            self.bookings.clone(),
            self.queue.clone(),
            self.config.reconcile.stale_after,
            self.config.reconcile.batch_size,
        )
    }

    /// Start the worker pool, the terminal-failure listener and the reconciler.
    pub fn start(&self) -> PipelineHandle {
        // The listener subscribes before any worker can publish an outcome.
        let listener = self.listener().spawn();

        let mut executor = JobExecutor::new(self.queue.clone());
        executor.register_handler(
            BOOKING_QUEUE,
            FulfillmentWorker::new(self.bookings.clone(), self.vendor.clone()),
        );
        let executor = executor.spawn(self.config.executor_config());

        let reconciler = self.reconciler().spawn(self.config.reconcile.interval);

        info!(
            concurrency = self.config.worker.concurrency,
            max_attempts = self.config.retry.max_attempts,
            "fulfillment pipeline started"
        );

        PipelineHandle {
            executor,
            listener,
            reconciler,
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Running pipeline.
#[derive(Debug)]
pub struct PipelineHandle {
    executor: JobExecutorHandle,
    listener: TaskHandle,
    reconciler: TaskHandle,
}

impl PipelineHandle {
    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Stop the workers (in-flight jobs go back to the queue), then the
    /// listener (after draining buffered events) and the reconciler.
    pub async fn shutdown(self) {
        self.executor.shutdown().await;
        self.listener.shutdown().await;
        self.reconciler.shutdown().await;
        info!("fulfillment pipeline stopped");
    }
}
