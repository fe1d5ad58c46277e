//! Postgres-backed job store.
//!
//! Each row holds the full job document in `body` (JSONB) next to the columns
//! the queue filters on. State changes reuse the [`Job`] transition methods on a
//! row locked `FOR UPDATE`, so the in-memory and Postgres stores cannot drift
//! apart in their retry semantics.
//!
//! `claim_next` locks candidates with `FOR UPDATE SKIP LOCKED`: concurrent
//! workers (in one process or many) never claim the same delivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{instrument, warn};

use super::store::{Claim, JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobStatus};

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    /// Load a job owned by delivery `attempt`, apply `f`, and persist it.
    async fn update_owned(
        &self,
        operation: &str,
        job_id: JobId,
        attempt: u32,
        f: impl FnOnce(&mut Job) + Send,
    ) -> Result<Job, JobStoreError> {
        let mut tx = self.begin(operation).await?;

        let row = sqlx::query("SELECT body FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.0)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = decode_job(&row)?;
        if !job.is_owned_by(attempt) {
            return Err(JobStoreError::LeaseLost(job_id));
        }

        f(&mut job);
        save(&mut tx, &job, operation).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(job)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let body = encode_job(&job)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id,
                queue,
                dedupe_key,
                status,
                attempt,
                available_at,
                created_at,
                updated_at,
                body
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.queue)
        .bind(job.dedupe_key.as_deref())
        .bind(job.status.as_str())
        .bind(job.attempt as i32)
        .bind(available_at(&job))
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(
                    job.dedupe_key.clone().unwrap_or_else(|| job.id.to_string()),
                )
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        sqlx::query("SELECT body FROM jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .map(|row| decode_job(&row))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_by_dedupe_key(&self, key: &str) -> Result<Option<Job>, JobStoreError> {
        sqlx::query("SELECT body FROM jobs WHERE dedupe_key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_dedupe_key", e))?
            .map(|row| decode_job(&row))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self, queue: &str, lease: Duration) -> Result<Claim, JobStoreError> {
        let mut tx = self.begin("claim_next").await?;
        let now = Utc::now();
        let mut stalled_out = Vec::new();

        loop {
            let row = sqlx::query(
                r#"
                SELECT body
                FROM jobs
                WHERE queue = $1 AND available_at <= $2
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(queue)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

            let Some(row) = row else {
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("claim_next", e))?;
                return Ok(Claim {
                    job: None,
                    stalled_out,
                });
            };

            let mut job = decode_job(&row)?;

            // A job that stalled on its last allowed delivery is exhausted, not redelivered.
            if job.is_stalled(now) && job.retry_policy.is_exhausted(job.attempt) {
                warn!(job_id = %job.id, attempts = job.attempt, "stalled job dead-lettered");
                job.mark_stalled_out(now);
                save(&mut tx, &job, "claim_next").await?;
                stalled_out.push(job);
                continue;
            }

            job.mark_running(now, lease);
            save(&mut tx, &job, "claim_next").await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("claim_next", e))?;
            return Ok(Claim {
                job: Some(job),
                stalled_out,
            });
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn complete(&self, job_id: JobId, attempt: u32) -> Result<Job, JobStoreError> {
        self.update_owned("complete", job_id, attempt, |job| {
            job.mark_completed(Utc::now())
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn fail(&self, job_id: JobId, attempt: u32, error: &str) -> Result<Job, JobStoreError> {
        let error = error.to_string();
        self.update_owned("fail", job_id, attempt, move |job| {
            job.mark_failed(error, Utc::now())
        })
        .await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn release(&self, job_id: JobId, attempt: u32) -> Result<(), JobStoreError> {
        self.update_owned("release", job_id, attempt, |job| {
            job.mark_released(Utc::now())
        })
        .await
        .map(|_| ())
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, queue: &str) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM jobs
            WHERE queue = $1
            GROUP BY status
            "#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let total = total.max(0) as usize;

            match status.as_str() {
                "pending" => stats.pending += total,
                "running" => stats.running += total,
                "completed" => stats.completed += total,
                "failed" => stats.failed += total,
                "dead_lettered" => stats.dead_lettered += total,
                other => warn!(status = other, "unknown job status in store"),
            }
        }
        Ok(stats)
    }
}

async fn save(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    operation: &str,
) -> Result<(), JobStoreError> {
    let body = encode_job(job)?;

    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2,
            attempt = $3,
            available_at = $4,
            updated_at = $5,
            body = $6
        WHERE id = $1
        "#,
    )
    .bind(job.id.0)
    .bind(job.status.as_str())
    .bind(job.attempt as i32)
    .bind(available_at(job))
    .bind(job.updated_at)
    .bind(body)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;

    Ok(())
}

/// When the job can next be claimed, or `None` once it is terminal.
fn available_at(job: &Job) -> Option<DateTime<Utc>> {
    match job.status {
        JobStatus::Pending => Some(job.scheduled_at.unwrap_or(job.created_at)),
        JobStatus::Failed { .. } => Some(job.scheduled_at.unwrap_or(job.updated_at)),
        JobStatus::Running => job.lease_until,
        JobStatus::Completed | JobStatus::DeadLettered { .. } => None,
    }
}

fn encode_job(job: &Job) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(job).map_err(|e| JobStoreError::InvalidPayload(e.to_string()))
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let body: serde_json::Value = row
        .try_get("body")
        .map_err(|e| JobStoreError::Storage(format!("failed to read job row: {e}")))?;
    serde_json::from_value(body)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job document: {e}")))
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::RetryPolicy;

    #[test]
    fn availability_follows_status() {
        let now = Utc::now();
        let mut job = Job::new("q", serde_json::json!({}))
            .with_retry_policy(RetryPolicy::exponential(2, Duration::from_secs(1)));
        assert_eq!(available_at(&job), Some(job.created_at));

        job.mark_running(now, Duration::from_secs(30));
        assert_eq!(available_at(&job), job.lease_until);

        job.mark_failed("boom".into(), now);
        assert_eq!(available_at(&job), job.scheduled_at);
        assert!(available_at(&job).unwrap() > now);

        job.mark_running(now, Duration::from_secs(30));
        job.mark_failed("boom".into(), now);
        assert!(matches!(job.status, JobStatus::DeadLettered { .. }));
        assert_eq!(available_at(&job), None);
    }

    #[test]
    fn job_document_survives_encoding() {
        let job = Job::new("q", serde_json::json!({ "bookingId": 7 })).with_dedupe_key("booking:7");
        let body = encode_job(&job).unwrap();
        let decoded: Job = serde_json::from_value(body).unwrap();
        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.dedupe_key.as_deref(), Some("booking:7"));
        assert_eq!(decoded.retry_policy, job.retry_policy);
    }
}
