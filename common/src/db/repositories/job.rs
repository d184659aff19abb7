// Job repository implementation
// SQLite-backed JobStore over the `scheduled_jobs` table

use crate::db::DbPool;
use crate::errors::StoreError;
use crate::jobstore::{decode_job, encode_job, JobStore};
use crate::models::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, warn};

/// Repository for scheduled job records
///
/// `next_run_time` is stored as epoch microseconds so due-time comparisons
/// and ordering are numeric.
#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: DbPool,
}

fn to_micros(time: Option<DateTime<Utc>>) -> Option<i64> {
    time.map(|t| t.timestamp_micros())
}

fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

impl JobRepository {
    /// Create a new JobRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Restore rows, deleting any whose state no longer decodes
    async fn restore_and_prune(&self, rows: Vec<(String, Vec<u8>)>) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::with_capacity(rows.len());

        for (job_id, state) in rows {
            match decode_job(&job_id, &state) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Unable to restore job, removing it");
                    // a concurrent upsert may have replaced the blob since it was read
                    sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?1 AND job_state = ?2")
                        .bind(&job_id)
                        .bind(&state)
                        .execute(self.pool.pool())
                        .await?;
                }
            }
        }

        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for JobRepository {
    #[instrument(skip(self))]
    async fn lookup(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let state: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT job_state FROM scheduled_jobs WHERE id = ?1")
                .bind(job_id)
                .fetch_optional(self.pool.pool())
                .await?;

        let Some(state) = state else {
            return Ok(None);
        };

        match decode_job(job_id, &state) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Unable to restore job");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT id, job_state
            FROM scheduled_jobs
            WHERE next_run_time IS NOT NULL AND next_run_time <= ?1
            ORDER BY next_run_time ASC, id ASC
            "#,
        )
        .bind(now.timestamp_micros())
        .fetch_all(self.pool.pool())
        .await?;

        let jobs = self.restore_and_prune(rows).await?;
        debug!(count = jobs.len(), "Found jobs due for execution");
        Ok(jobs)
    }

    #[instrument(skip(self))]
    async fn get_all(&self) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
            r#"
            SELECT id, job_state
            FROM scheduled_jobs
            ORDER BY next_run_time IS NULL, next_run_time ASC, id ASC
            "#,
        )
        .fetch_all(self.pool.pool())
        .await?;

        self.restore_and_prune(rows).await
    }

    async fn get_next_wake_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let earliest: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(next_run_time) FROM scheduled_jobs WHERE next_run_time IS NOT NULL",
        )
        .fetch_one(self.pool.pool())
        .await?;

        Ok(earliest.and_then(from_micros))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    async fn upsert(&self, job: &Job) -> Result<bool, StoreError> {
        let state = encode_job(job)?;
        let now = Utc::now();
        let mut tx = self.pool.pool().begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (id, name, job_state, next_run_time, updated_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&state)
        .bind(to_micros(job.next_run_time))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let overwritten = inserted.rows_affected() == 0;
        if overwritten {
            warn!("Job id already registered, overwriting stored job");
            sqlx::query(
                r#"
                UPDATE scheduled_jobs
                SET name = ?2, job_state = ?3, next_run_time = ?4, updated_at = ?5
                WHERE id = ?1
                "#,
            )
            .bind(&job.id)
            .bind(&job.name)
            .bind(&state)
            .bind(to_micros(job.next_run_time))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(next_run_time = ?job.next_run_time, "Job stored");
        Ok(overwritten)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let state = encode_job(job)?;

        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET name = ?2, job_state = ?3, next_run_time = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(&job.id)
        .bind(&job.name)
        .bind(&state)
        .bind(to_micros(job.next_run_time))
        .bind(Utc::now())
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job.id.clone()));
        }

        debug!(next_run_time = ?job.next_run_time, "Job updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?1")
            .bind(job_id)
            .execute(self.pool.pool())
            .await?;

        let removed = result.rows_affected() > 0;
        if removed {
            tracing::info!(job_id = %job_id, "Job removed");
        } else {
            debug!(job_id = %job_id, "Job not in store, nothing to remove");
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn remove_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs")
            .execute(self.pool.pool())
            .await?;

        tracing::info!(count = result.rows_affected(), "All jobs removed");
        Ok(result.rows_affected())
    }
}
