// Read-only administrative views over jobs and their execution history

use crate::db::repositories::{ExecutionFilter, ExecutionRepository};
use crate::errors::{DatabaseError, StoreError};
use crate::jobstore::JobStore;
use crate::models::{format_duration, ExecutionRecord, ExecutionStatus};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

pub const PAUSED_LABEL: &str = "(paused)";

/// One line of the job listing
#[derive(Debug, Clone, Serialize)]
pub struct JobRow {
    pub id: String,
    pub name: String,
    pub next_run_time: Option<DateTime<Utc>>,
    /// Next run time, or `(paused)`
    pub next_run_display: String,
    #[serde(skip)]
    pub average_duration: Option<Duration>,
    pub average_duration_display: String,
}

/// One line of the execution history listing
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRow {
    pub id: i64,
    pub job_id: String,
    pub job_name: String,
    pub instance_id: String,
    pub status: ExecutionStatus,
    pub status_label: &'static str,
    pub start_tm: DateTime<Utc>,
    pub end_tm: Option<DateTime<Utc>>,
    pub duration: String,
    pub trace_message: Option<String>,
}

impl From<ExecutionRecord> for ExecutionRow {
    fn from(record: ExecutionRecord) -> Self {
        let duration = record.duration_display();
        Self {
            id: record.id,
            job_id: record.job_id,
            job_name: record.job_name,
            instance_id: record.instance_id,
            status: record.status,
            status_label: record.status.label(),
            start_tm: record.start_tm,
            end_tm: record.end_tm,
            duration,
            trace_message: record.trace_message,
        }
    }
}

/// AdminReader answers operator queries without mutating anything
pub struct AdminReader {
    store: Arc<dyn JobStore>,
    executions: Arc<ExecutionRepository>,
}

impl AdminReader {
    pub fn new(store: Arc<dyn JobStore>, executions: Arc<ExecutionRepository>) -> Self {
        Self { store, executions }
    }

    /// All jobs in listing order with their average execution duration
    #[instrument(skip(self))]
    pub async fn list_jobs(&self) -> Result<Vec<JobRow>, StoreError> {
        let jobs = self.store.get_all().await?;
        let mut rows = Vec::with_capacity(jobs.len());

        for job in jobs {
            let average_duration = self.executions.average_duration(&job.id).await?;
            rows.push(JobRow {
                next_run_display: job.next_run_time.map_or_else(
                    || PAUSED_LABEL.to_string(),
                    |t| t.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                average_duration_display: average_duration
                    .map_or_else(|| "-".to_string(), format_duration),
                average_duration,
                next_run_time: job.next_run_time,
                id: job.id,
                name: job.name,
            });
        }

        Ok(rows)
    }

    /// Execution history, newest first
    #[instrument(skip(self))]
    pub async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRow>, DatabaseError> {
        let records = self.executions.find_with_filter(filter).await?;
        Ok(records.into_iter().map(ExecutionRow::from).collect())
    }
}
