//! Database wiring: connection pool and schema migrations.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_bookings", include_str!("../migrations/0001_bookings.sql")),
    ("0002_jobs", include_str!("../migrations/0002_jobs.sql")),
];

/// Open a Postgres connection pool.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Apply the schema. Every statement is idempotent, so this runs on each startup.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    for (name, sql) in MIGRATIONS {
        sqlx::raw_sql(sql).execute(pool).await?;
        info!(migration = name, "migration applied");
    }
    Ok(())
}
