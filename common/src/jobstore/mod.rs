// Job store contract shared by the SQLite repository and the in-memory store

pub mod memory;

pub use memory::MemoryJobStore;

use crate::errors::StoreError;
use crate::models::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// JobStore is the durable repository of job records used by the dispatch loop.
///
/// Implementations must be safe to call concurrently from the dispatch loop,
/// the registration API and administrative readers. Every operation is atomic
/// per job id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fetch one job. A record that fails to restore is logged and reported as absent.
    async fn lookup(&self, job_id: &str) -> Result<Option<Job>, StoreError>;

    /// Jobs with `next_run_time <= now`, ascending by `next_run_time`.
    /// Records that fail to restore are pruned.
    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// All jobs, scheduled ones ascending by `next_run_time` and paused ones last.
    /// Records that fail to restore are pruned.
    async fn get_all(&self) -> Result<Vec<Job>, StoreError>;

    /// Earliest `next_run_time` among jobs that are not paused
    async fn get_next_wake_time(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Insert the job, or overwrite the existing record with the same id.
    ///
    /// Returns `true` when an existing record was overwritten.
    async fn upsert(&self, job: &Job) -> Result<bool, StoreError>;

    /// Replace the state of an existing job. Fails with `StoreError::NotFound`
    /// when no record has `job.id`; never inserts.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Delete a job. Returns `false` when it did not exist.
    async fn remove(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Delete every job, returning how many were removed
    async fn remove_all(&self) -> Result<u64, StoreError>;
}

/// Encode a job for persistence
pub(crate) fn encode_job(job: &Job) -> Result<Vec<u8>, StoreError> {
    job.to_state_bytes()
        .map_err(|e| StoreError::Serialization {
            job_id: job.id.clone(),
            reason: e.to_string(),
        })
}

/// Restore a job from its persisted blob
pub(crate) fn decode_job(job_id: &str, state: &[u8]) -> Result<Job, StoreError> {
    Job::from_state_bytes(state).map_err(|reason| StoreError::Deserialization {
        job_id: job_id.to_string(),
        reason,
    })
}

/// Order jobs the way `get_all` reports them
pub(crate) fn sort_for_listing(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| match (a.next_run_time, b.next_run_time) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trigger;
    use chrono::TimeZone;

    fn job(id: &str, next: Option<DateTime<Utc>>) -> Job {
        Job {
            id: id.to_string(),
            name: id.to_string(),
            trigger: Trigger::date(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            callable: "noop".to_string(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            misfire_grace_time: None,
            coalesce: true,
            max_instances: 1,
            next_run_time: next,
        }
    }

    #[test]
    fn test_paused_jobs_sort_last() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mut jobs = vec![job("paused", None), job("late", Some(late)), job("early", Some(early))];

        sort_for_listing(&mut jobs);

        let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late", "paused"]);
    }

    #[test]
    fn test_decode_failure_names_the_job() {
        let err = decode_job("broken", b"{").unwrap_err();
        assert!(matches!(err, StoreError::Deserialization { ref job_id, .. } if job_id == "broken"));
    }
}
