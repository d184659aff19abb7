// Execution repository implementation
// Execution history ledger with idempotent upserts keyed by instance id

use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{ExecutionRecord, ExecutionStatus};
use chrono::{DateTime, Duration, Utc};
use tracing::{instrument, warn};

const SELECT_COLUMNS: &str = r#"
    SELECT id, job_id, job_name, status, instance_id, start_tm, end_tm, trace_message
    FROM job_executions
"#;

/// Repository for the `job_executions` table
#[derive(Debug, Clone)]
pub struct ExecutionRepository {
    pool: DbPool,
}

impl ExecutionRepository {
    /// Create a new ExecutionRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Record that an execution was submitted.
    ///
    /// Inserts a `running` record. When a record for the instance already
    /// exists (its terminal event was stored first) only `start_tm` is updated
    /// and the terminal status is kept. Returns `false` when the owning job no
    /// longer exists and nothing was stored.
    #[instrument(skip(self), fields(job_id = %job_id, instance_id = %instance_id))]
    pub async fn record_submitted(
        &self,
        job_id: &str,
        job_name: &str,
        instance_id: &str,
        start_tm: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_executions (job_id, job_name, status, instance_id, start_tm)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(job_id)
        .bind(job_name)
        .bind(ExecutionStatus::Running.to_string())
        .bind(instance_id)
        .bind(start_tm)
        .execute(self.pool.pool())
        .await
        .map_err(DatabaseError::from);

        match inserted {
            Ok(_) => {
                tracing::debug!("Execution record created");
                Ok(true)
            }
            Err(DatabaseError::DuplicateKey(_)) => {
                sqlx::query("UPDATE job_executions SET start_tm = ?1 WHERE instance_id = ?2")
                    .bind(start_tm)
                    .bind(instance_id)
                    .execute(self.pool.pool())
                    .await?;
                tracing::debug!("Execution already recorded, start time updated");
                Ok(true)
            }
            Err(DatabaseError::ForeignKeyViolation(reason)) => {
                warn!(reason = %reason, "Job no longer exists, execution not recorded");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Record the terminal outcome of an execution.
    ///
    /// Updates the record matching `instance_id` and `job_name`. When none
    /// exists a record is created with `start_tm = event_time`; if that insert
    /// collides with a concurrent writer the record is updated by
    /// `instance_id` alone. Returns `false` when the owning job no longer
    /// exists.
    #[instrument(skip(self, trace_message), fields(job_id = %job_id, instance_id = %instance_id, status = %status))]
    pub async fn record_outcome(
        &self,
        job_id: &str,
        job_name: &str,
        instance_id: &str,
        status: ExecutionStatus,
        event_time: DateTime<Utc>,
        trace_message: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let updated = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = ?1, end_tm = ?2, trace_message = ?3
            WHERE instance_id = ?4 AND job_name = ?5
            "#,
        )
        .bind(status.to_string())
        .bind(event_time)
        .bind(trace_message)
        .bind(instance_id)
        .bind(job_name)
        .execute(self.pool.pool())
        .await?;

        if updated.rows_affected() > 0 {
            tracing::debug!("Execution record updated");
            return Ok(true);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_executions (job_id, job_name, status, instance_id, start_tm, end_tm, trace_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6)
            "#,
        )
        .bind(job_id)
        .bind(job_name)
        .bind(status.to_string())
        .bind(instance_id)
        .bind(event_time)
        .bind(trace_message)
        .execute(self.pool.pool())
        .await
        .map_err(DatabaseError::from);

        match inserted {
            Ok(_) => {
                tracing::debug!("Execution record created from terminal event");
                Ok(true)
            }
            Err(DatabaseError::DuplicateKey(_)) => {
                sqlx::query(
                    r#"
                    UPDATE job_executions
                    SET status = ?1, end_tm = ?2, trace_message = ?3
                    WHERE instance_id = ?4
                    "#,
                )
                .bind(status.to_string())
                .bind(event_time)
                .bind(trace_message)
                .bind(instance_id)
                .execute(self.pool.pool())
                .await?;
                Ok(true)
            }
            Err(DatabaseError::ForeignKeyViolation(reason)) => {
                warn!(reason = %reason, "Job no longer exists, execution not recorded");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Find the record of one fire attempt
    #[instrument(skip(self))]
    pub async fn find_by_instance_id(
        &self,
        instance_id: &str,
    ) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let query = format!("{SELECT_COLUMNS} WHERE instance_id = ?1");
        let record = sqlx::query_as::<_, ExecutionRecord>(&query)
            .bind(instance_id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(record)
    }

    /// Find executions matching the filter, newest first
    #[instrument(skip(self))]
    pub async fn find_with_filter(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let mut query = format!("{SELECT_COLUMNS} WHERE 1 = 1");

        if filter.job_id.is_some() {
            query.push_str(" AND job_id = ?");
        }
        if filter.job_name.is_some() {
            query.push_str(" AND job_name = ?");
        }
        if filter.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY start_tm DESC, id DESC");

        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }

        let mut query_builder = sqlx::query_as::<_, ExecutionRecord>(&query);

        if let Some(job_id) = filter.job_id {
            query_builder = query_builder.bind(job_id);
        }
        if let Some(job_name) = filter.job_name {
            query_builder = query_builder.bind(job_name);
        }
        if let Some(status) = filter.status {
            query_builder = query_builder.bind(status.to_string());
        }

        let executions = query_builder.fetch_all(self.pool.pool()).await?;

        tracing::debug!(count = executions.len(), "Found executions with filter");
        Ok(executions)
    }

    /// Count executions of a job in one status
    #[instrument(skip(self))]
    pub async fn count_by_status(
        &self,
        job_id: &str,
        status: ExecutionStatus,
    ) -> Result<i64, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_executions WHERE job_id = ?1 AND status = ?2",
        )
        .bind(job_id)
        .bind(status.to_string())
        .fetch_one(self.pool.pool())
        .await?;

        Ok(count)
    }

    /// Average duration of the finished executions of a job.
    ///
    /// Each duration is clamped at zero before averaging. `None` when the job
    /// has no finished execution.
    #[instrument(skip(self))]
    pub async fn average_duration(&self, job_id: &str) -> Result<Option<Duration>, DatabaseError> {
        let spans: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT start_tm, end_tm FROM job_executions WHERE job_id = ?1 AND end_tm IS NOT NULL",
        )
        .bind(job_id)
        .fetch_all(self.pool.pool())
        .await?;

        if spans.is_empty() {
            return Ok(None);
        }

        let total_ms: i64 = spans
            .iter()
            .map(|(start, end)| (*end - *start).num_milliseconds().max(0))
            .sum();

        Ok(Some(Duration::milliseconds(total_ms / spans.len() as i64)))
    }
}

/// Filter for querying executions
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub job_id: Option<String>,
    pub job_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, s).unwrap()
    }

    async fn repo_with_job(job_id: &str) -> ExecutionRepository {
        let pool = DbPool::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO scheduled_jobs (id, name, job_state, next_run_time, updated_at, created_at)
             VALUES (?1, 'report', x'7b7d', NULL, ?2, ?2)",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(pool.pool())
        .await
        .unwrap();
        ExecutionRepository::new(pool)
    }

    #[test]
    fn test_execution_filter_default() {
        let filter = ExecutionFilter::default();
        assert!(filter.job_id.is_none());
        assert!(filter.job_name.is_none());
        assert!(filter.status.is_none());
        assert!(filter.limit.is_none());
    }

    #[tokio::test]
    async fn test_submitted_then_success() {
        let repo = repo_with_job("j1").await;
        assert!(repo.record_submitted("j1", "report", "i-1", at(0)).await.unwrap());
        assert!(repo
            .record_outcome("j1", "report", "i-1", ExecutionStatus::Success, at(4), None)
            .await
            .unwrap());

        let record = repo.find_by_instance_id("i-1").await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.start_tm, at(0));
        assert_eq!(record.end_tm, Some(at(4)));
        assert_eq!(record.duration_display(), "00:00:04");
    }

    #[tokio::test]
    async fn test_outcome_before_submitted_keeps_terminal_status() {
        let repo = repo_with_job("j1").await;
        repo.record_outcome("j1", "report", "i-1", ExecutionStatus::Success, at(5), None)
            .await
            .unwrap();
        repo.record_submitted("j1", "report", "i-1", at(1)).await.unwrap();

        let records = repo.find_with_filter(ExecutionFilter::default()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Success);
        assert_eq!(records[0].start_tm, at(1));
        assert_eq!(records[0].end_tm, Some(at(5)));
    }

    #[tokio::test]
    async fn test_error_outcome_stores_trace() {
        let repo = repo_with_job("j1").await;
        repo.record_submitted("j1", "report", "i-1", at(0)).await.unwrap();
        repo.record_outcome(
            "j1",
            "report",
            "i-1",
            ExecutionStatus::Error,
            at(2),
            Some("division by zero"),
        )
        .await
        .unwrap();

        let record = repo.find_by_instance_id("i-1").await.unwrap().unwrap();
        assert_eq!(record.trace_message.as_deref(), Some("division by zero"));
    }

    #[tokio::test]
    async fn test_events_for_missing_job_are_dropped() {
        let repo = repo_with_job("j1").await;
        assert!(!repo.record_submitted("gone", "old", "i-9", at(0)).await.unwrap());
        assert!(!repo
            .record_outcome("gone", "old", "i-9", ExecutionStatus::Missed, at(1), None)
            .await
            .unwrap());
        assert!(repo.find_by_instance_id("i-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filter_by_status_newest_first() {
        let repo = repo_with_job("j1").await;
        for (i, status) in [
            ExecutionStatus::Success,
            ExecutionStatus::Missed,
            ExecutionStatus::Success,
        ]
        .into_iter()
        .enumerate()
        {
            let instance = format!("i-{i}");
            repo.record_submitted("j1", "report", &instance, at(i as u32 * 10))
                .await
                .unwrap();
            repo.record_outcome("j1", "report", &instance, status, at(i as u32 * 10 + 1), None)
                .await
                .unwrap();
        }

        let successes = repo
            .find_with_filter(ExecutionFilter {
                status: Some(ExecutionStatus::Success),
                ..Default::default()
            })
            .await
            .unwrap();
        let ids: Vec<_> = successes.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["i-2", "i-0"]);

        assert_eq!(
            repo.count_by_status("j1", ExecutionStatus::Missed).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_average_duration_clamps_negative_spans() {
        let repo = repo_with_job("j1").await;
        assert_eq!(repo.average_duration("j1").await.unwrap(), None);

        repo.record_submitted("j1", "report", "i-1", at(0)).await.unwrap();
        repo.record_outcome("j1", "report", "i-1", ExecutionStatus::Success, at(10), None)
            .await
            .unwrap();
        // clock skew: ends before it starts
        repo.record_submitted("j1", "report", "i-2", at(30)).await.unwrap();
        repo.record_outcome("j1", "report", "i-2", ExecutionStatus::Success, at(20), None)
            .await
            .unwrap();

        assert_eq!(
            repo.average_duration("j1").await.unwrap(),
            Some(Duration::seconds(5))
        );
    }
}
