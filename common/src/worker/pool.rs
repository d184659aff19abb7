// Execution worker pool
//
// Runs job callables on tokio tasks, bounded globally by a semaphore and per
// job by `max_instances`. Failures and panics become Error events.

use crate::errors::ExecutionError;
use crate::events::{EventBus, EventMeta, JobEvent};
use crate::models::Job;
use crate::telemetry;
use crate::worker::registry::{JobInvocation, JobRegistry};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{error, info, instrument, warn};

/// One fire of a job handed to the pool
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRun {
    pub instance_id: String,
    pub run_time: DateTime<Utc>,
}

impl ScheduledRun {
    /// A run with a fresh instance id
    pub fn new(run_time: DateTime<Utc>) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            run_time,
        }
    }
}

struct PoolInner {
    registry: JobRegistry,
    events: EventBus,
    slots: Arc<Semaphore>,
    running: Mutex<HashMap<String, u32>>,
    in_flight: watch::Sender<usize>,
}

/// WorkerPool executes submitted runs off the dispatch loop
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(registry: JobRegistry, events: EventBus, max_workers: usize) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(PoolInner {
                registry,
                events,
                slots: Arc::new(Semaphore::new(max_workers.max(1))),
                running: Mutex::new(HashMap::new()),
                in_flight,
            }),
        }
    }

    /// Submit the runs of one job as a single running instance.
    ///
    /// Emits Submitted for every run before execution starts. Fails with
    /// `ExecutionError::MaxInstancesReached` without emitting anything when the
    /// job already has `max_instances` instances running; the caller reports it.
    #[instrument(skip(self, job, runs), fields(job_id = %job.id, job_name = %job.name, runs = runs.len()))]
    pub async fn submit(&self, job: &Job, runs: Vec<ScheduledRun>) -> Result<(), ExecutionError> {
        {
            let mut running = self.inner.running.lock().await;
            let count = running.entry(job.id.clone()).or_insert(0);
            if *count >= job.max_instances {
                warn!(
                    running = *count,
                    max_instances = job.max_instances,
                    "Execution of job skipped: maximum number of running instances reached"
                );
                return Err(ExecutionError::MaxInstancesReached {
                    job_id: job.id.clone(),
                    max_instances: job.max_instances,
                });
            }
            *count += 1;
        }
        self.inner.in_flight.send_modify(|n| *n += 1);

        for run in &runs {
            self.inner.events.publish(JobEvent::Submitted(EventMeta::new(
                &job.id,
                &job.name,
                &run.instance_id,
                run.run_time,
            )));
        }

        let inner = Arc::clone(&self.inner);
        let job = job.clone();
        tokio::spawn(async move {
            // never closed, so the permit is always granted
            let permit = inner.slots.clone().acquire_owned().await;
            for run in runs {
                inner.execute(&job, run).await;
            }
            drop(permit);
            inner.release(&job.id).await;
        });

        Ok(())
    }

    /// Number of running instances of a job
    pub async fn running_instances(&self, job_id: &str) -> u32 {
        self.inner
            .running
            .lock()
            .await
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    /// Wait until no instance is running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.in_flight.subscribe();
        let idle = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok();
        idle
    }
}

impl PoolInner {
    async fn execute(&self, job: &Job, run: ScheduledRun) {
        let meta = || EventMeta::new(&job.id, &job.name, &run.instance_id, run.run_time);

        let Some(callable) = self.registry.get(&job.callable) else {
            let err = ExecutionError::CallableNotRegistered(job.callable.clone());
            error!(job_id = %job.id, instance_id = %run.instance_id, error = %err, "Job run failed");
            telemetry::record_job_failure(&job.id, &job.name, "callable_not_registered");
            self.events.publish(JobEvent::Error {
                meta: meta(),
                message: err.to_string(),
                trace: err.to_string(),
            });
            return;
        };

        let invocation = JobInvocation {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            instance_id: run.instance_id.clone(),
            scheduled_run_time: run.run_time,
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(async move { callable(invocation).await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed().as_secs_f64();
        telemetry::record_job_duration(&job.id, &job.name, elapsed);

        match outcome {
            Ok(Ok(())) => {
                info!(
                    job_id = %job.id,
                    job_name = %job.name,
                    instance_id = %run.instance_id,
                    duration_seconds = elapsed,
                    "Job executed successfully"
                );
                telemetry::record_job_success(&job.id, &job.name);
                self.events.publish(JobEvent::Executed(meta()));
            }
            Ok(Err(e)) => {
                error!(
                    job_id = %job.id,
                    job_name = %job.name,
                    instance_id = %run.instance_id,
                    error = %e,
                    "Job raised an error"
                );
                telemetry::record_job_failure(&job.id, &job.name, "error");
                self.events.publish(JobEvent::Error {
                    meta: meta(),
                    message: e.to_string(),
                    trace: format!("{e:?}"),
                });
            }
            Err(panic) => {
                let err = ExecutionError::Panicked(panic_message(panic.as_ref()));
                error!(
                    job_id = %job.id,
                    job_name = %job.name,
                    instance_id = %run.instance_id,
                    error = %err,
                    "Job panicked"
                );
                telemetry::record_job_failure(&job.id, &job.name, "panic");
                self.events.publish(JobEvent::Error {
                    meta: meta(),
                    message: err.to_string(),
                    trace: err.to_string(),
                });
            }
        }
    }

    async fn release(&self, job_id: &str) {
        {
            let mut running = self.running.lock().await;
            if let Some(count) = running.get_mut(job_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    running.remove(job_id);
                }
            }
        }
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
