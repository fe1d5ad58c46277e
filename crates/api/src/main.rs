use anyhow::Context;

use reservo_api::app::{build_app, services};
use reservo_infra::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    reservo_observability::init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let port: u16 = match std::env::var("PORT") {
        Ok(raw) => raw.parse().with_context(|| format!("invalid PORT: {raw:?}"))?,
        Err(_) => 3000,
    };
    let database_url = std::env::var("DATABASE_URL").ok();

    let services = services::build_services(config, database_url.as_deref())
        .await
        .context("failed to initialize storage")?;
    let pipeline = services.start();
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind 0.0.0.0:{port}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    pipeline.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
