// In-memory job store
//
// Keeps the same encoded blobs as the SQL store so corrupt-state handling
// behaves identically. Useful for tests and for schedulers without persistence.

use super::{decode_job, encode_job, sort_for_listing, JobStore};
use crate::errors::StoreError;
use crate::models::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};

#[derive(Debug, Clone)]
struct StoredJob {
    state: Vec<u8>,
    next_run_time: Option<DateTime<Utc>>,
}

/// Job store backed by a `HashMap` behind a tokio `RwLock`
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, StoredJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an already encoded state blob under `job_id`
    pub async fn insert_raw(
        &self,
        job_id: &str,
        state: Vec<u8>,
        next_run_time: Option<DateTime<Utc>>,
    ) {
        self.jobs.write().await.insert(
            job_id.to_string(),
            StoredJob {
                state,
                next_run_time,
            },
        );
    }

    /// Number of stored records, including ones that would fail to restore
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Restore the selected records, dropping the ones that fail to decode
    async fn restore_and_prune(&self, selected: Vec<(String, Vec<u8>)>) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(selected.len());
        let mut corrupt = Vec::new();

        for (job_id, state) in selected {
            match decode_job(&job_id, &state) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Unable to restore job, removing it");
                    corrupt.push((job_id, state));
                }
            }
        }

        if !corrupt.is_empty() {
            let mut guard = self.jobs.write().await;
            for (job_id, state) in &corrupt {
                // skip entries replaced since they were read
                if guard.get(job_id).is_some_and(|stored| &stored.state == state) {
                    guard.remove(job_id);
                }
            }
        }

        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    #[instrument(skip(self))]
    async fn lookup(&self, job_id: &str) -> Result<Option<Job>, StoreError> {
        let guard = self.jobs.read().await;
        let Some(stored) = guard.get(job_id) else {
            return Ok(None);
        };

        match decode_job(job_id, &stored.state) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Unable to restore job");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let selected: Vec<(String, Vec<u8>)> = {
            let guard = self.jobs.read().await;
            guard
                .iter()
                .filter(|(_, stored)| matches!(stored.next_run_time, Some(t) if t <= now))
                .map(|(id, stored)| (id.clone(), stored.state.clone()))
                .collect()
        };

        let mut jobs = self.restore_and_prune(selected).await;
        sort_for_listing(&mut jobs);
        Ok(jobs)
    }

    #[instrument(skip(self))]
    async fn get_all(&self) -> Result<Vec<Job>, StoreError> {
        let selected: Vec<(String, Vec<u8>)> = {
            let guard = self.jobs.read().await;
            guard
                .iter()
                .map(|(id, stored)| (id.clone(), stored.state.clone()))
                .collect()
        };

        let mut jobs = self.restore_and_prune(selected).await;
        sort_for_listing(&mut jobs);
        Ok(jobs)
    }

    async fn get_next_wake_time(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let guard = self.jobs.read().await;
        Ok(guard.values().filter_map(|stored| stored.next_run_time).min())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    async fn upsert(&self, job: &Job) -> Result<bool, StoreError> {
        let state = encode_job(job)?;
        let previous = self.jobs.write().await.insert(
            job.id.clone(),
            StoredJob {
                state,
                next_run_time: job.next_run_time,
            },
        );

        let overwritten = previous.is_some();
        if overwritten {
            warn!("Job id already registered, overwriting stored job");
        } else {
            debug!("Job added to store");
        }
        Ok(overwritten)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let state = encode_job(job)?;
        let mut guard = self.jobs.write().await;
        let stored = guard
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::NotFound(job.id.clone()))?;

        stored.state = state;
        stored.next_run_time = job.next_run_time;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove(&self, job_id: &str) -> Result<bool, StoreError> {
        let removed = self.jobs.write().await.remove(job_id).is_some();
        if !removed {
            debug!(job_id = %job_id, "Job not in store, nothing to remove");
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn remove_all(&self) -> Result<u64, StoreError> {
        let mut guard = self.jobs.write().await;
        let count = guard.len() as u64;
        guard.clear();
        Ok(count)
    }
}
