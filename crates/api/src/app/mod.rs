//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store selection and the fulfillment pipeline
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: AppServices) -> Router {
    routes::router().layer(ServiceBuilder::new().layer(Extension(Arc::new(services))))
}

pub use services::AppServices;
