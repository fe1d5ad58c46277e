//! Store selection and pipeline wiring for the HTTP layer.

use std::sync::Arc;

use reservo_infra::bookings::PostgresBookingStore;
use reservo_infra::jobs::PostgresJobStore;
use reservo_infra::vendor::SimulatedVendor;
use reservo_infra::{BookingService, Pipeline, PipelineConfig, PipelineHandle, db};

/// Shared state behind every handler.
#[derive(Debug, Clone)]
pub struct AppServices {
    pipeline: Pipeline,
}

impl AppServices {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    pub fn bookings(&self) -> &BookingService {
        self.pipeline.service()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Start the background fulfillment loops.
    pub fn start(&self) -> PipelineHandle {
        self.pipeline.start()
    }
}

/// Build the services: Postgres-backed when `database_url` is given
/// (migrations are applied first), in-memory otherwise.
pub async fn build_services(
    config: PipelineConfig,
    database_url: Option<&str>,
) -> Result<AppServices, sqlx::Error> {
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set; bookings are kept in memory");
        return Ok(AppServices::new(Pipeline::in_memory(config)));
    };

    let max_connections = (config.worker.concurrency as u32).saturating_add(4);
    let pool = db::connect(url, max_connections).await?;
    db::run_migrations(&pool).await?;
    tracing::info!("connected to postgres, migrations applied");

    let vendor = SimulatedVendor::random(
        config.vendor.failure_rate,
        config.vendor.min_delay,
        config.vendor.max_delay,
    );
    let pipeline = Pipeline::new(
        config,
        Arc::new(PostgresBookingStore::new(pool.clone())),
        Arc::new(PostgresJobStore::new(pool)),
        Arc::new(vendor),
    );
    Ok(AppServices::new(pipeline))
}
