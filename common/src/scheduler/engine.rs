// Scheduler engine implementation
//
// One dispatch loop per engine. Each pass pulls due jobs from the store,
// applies the misfire and coalescing policies, hands runs to the worker pool
// and reschedules from the last enumerated run time.

use crate::config::SchedulerSettings;
use crate::errors::{ExecutionError, SchedulerError, StoreError, TriggerError};
use crate::events::{EventBus, EventListener, EventMeta, JobEvent};
use crate::jobstore::JobStore;
use crate::models::{Job, Trigger};
use crate::scheduler::registration::{JobChanges, JobDefaults, JobSpec};
use crate::telemetry;
use crate::trigger::FireTimeCalculator;
use crate::worker::{JobRegistry, ScheduledRun, WorkerPool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

/// Upper bound on the fires of one job handled in a single pass
const MAX_RUNS_PER_PASS: usize = 1000;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on a single sleep of the dispatch loop
    pub max_poll_interval: Duration,
    pub max_workers: usize,
    /// How long `stop` waits for running jobs
    pub shutdown_grace: Duration,
    pub clear_store_on_shutdown: bool,
    pub job_defaults: JobDefaults,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_poll_interval: Duration::from_secs(60),
            max_workers: 10,
            shutdown_grace: Duration::from_secs(30),
            clear_store_on_shutdown: false,
            job_defaults: JobDefaults::default(),
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            max_poll_interval: Duration::from_secs(settings.max_poll_interval_seconds),
            max_workers: settings.max_workers,
            shutdown_grace: Duration::from_secs(settings.shutdown_grace_seconds),
            clear_store_on_shutdown: settings.clear_store_on_shutdown,
            job_defaults: JobDefaults::from(&settings.job_defaults),
        }
    }
}

/// Observable state of the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    ComputingDue,
    Dispatching,
    Sleeping,
    Stopped,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::ComputingDue => write!(f, "computing_due"),
            SchedulerState::Dispatching => write!(f, "dispatching"),
            SchedulerState::Sleeping => write!(f, "sleeping"),
            SchedulerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Scheduler trait for job scheduling operations
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run the dispatch loop until `stop` is called
    async fn start(&self) -> Result<(), SchedulerError>;

    /// Stop the loop, wait for running jobs and flush pending events
    async fn stop(&self) -> Result<(), SchedulerError>;

    /// Run one dispatch pass as of `now`, returning how many jobs were due
    async fn process_due_jobs(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError>;
}

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    pool: WorkerPool,
    events: EventBus,
    wakeup: Notify,
    planned_wake: Mutex<Option<DateTime<Utc>>>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    state_tx: watch::Sender<SchedulerState>,
}

impl SchedulerEngine {
    /// Create a new scheduler engine.
    ///
    /// Listeners are fixed for the lifetime of the engine. Must be called from
    /// within a tokio runtime since the event dispatcher is spawned here.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        registry: JobRegistry,
        listeners: Vec<Arc<dyn EventListener>>,
    ) -> Self {
        let events = EventBus::start(listeners);
        let pool = WorkerPool::new(registry, events.clone(), config.max_workers);
        let (shutdown_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(SchedulerState::Idle);

        Self {
            config,
            store,
            pool,
            events,
            wakeup: Notify::new(),
            planned_wake: Mutex::new(None),
            running: AtomicBool::new(false),
            shutdown_tx,
            state_tx,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state_tx.subscribe()
    }

    pub fn job_defaults(&self) -> &JobDefaults {
        &self.config.job_defaults
    }

    /// Interrupt the current sleep so the loop recomputes its wake time
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Number of running instances of a job
    pub async fn running_instances(&self, job_id: &str) -> u32 {
        self.pool.running_instances(job_id).await
    }

    /// Wait until every event published so far has reached the listeners
    pub async fn flush_events(&self) {
        self.events.flush().await;
    }

    /// Wait until no job is running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout).await
    }

    fn set_state(&self, state: SchedulerState) {
        self.state_tx.send_replace(state);
    }

    /// Forget the previous deadline so any job added while this cycle reads
    /// the store wakes the following sleep.
    async fn begin_cycle(&self) {
        *self.planned_wake.lock().await = None;
    }

    async fn wake_if_earlier(&self, next_run_time: Option<DateTime<Utc>>) {
        let Some(next) = next_run_time else {
            return;
        };
        let planned = *self.planned_wake.lock().await;
        if planned.map_or(true, |planned| next < planned) {
            debug!(next_run_time = %next, "Waking scheduler for earlier job");
            self.wake();
        }
    }

    // ------------------------------------------------------------------
    // Job management
    // ------------------------------------------------------------------

    /// Register a job, overwriting any job with the same id.
    ///
    /// When the trigger yields no fire time the job is stored paused.
    #[instrument(skip(self, spec), fields(callable = %spec.callable))]
    pub async fn add_job(&self, spec: JobSpec) -> Result<Job, SchedulerError> {
        let job = spec.into_job(&self.config.job_defaults, Utc::now())?;

        if job.is_paused() {
            info!(job_id = %job.id, job_name = %job.name, "Job added paused");
        }

        let overwritten = self.store.upsert(&job).await?;
        info!(
            job_id = %job.id,
            job_name = %job.name,
            trigger = job.trigger.kind(),
            next_run_time = ?job.next_run_time,
            overwritten,
            "Job added"
        );

        self.wake_if_earlier(job.next_run_time).await;
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, SchedulerError> {
        Ok(self.store.lookup(job_id).await?)
    }

    /// All jobs, paused ones last
    pub async fn get_jobs(&self) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.store.get_all().await?)
    }

    async fn require_job(&self, job_id: &str) -> Result<Job, SchedulerError> {
        self.store
            .lookup(job_id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    async fn persist(&self, job: &Job) -> Result<(), SchedulerError> {
        self.store.update(job).await.map_err(|e| match e {
            StoreError::NotFound(id) => SchedulerError::JobNotFound(id),
            other => other.into(),
        })
    }

    /// Stop a job from firing until it is resumed
    #[instrument(skip(self))]
    pub async fn pause_job(&self, job_id: &str) -> Result<Job, SchedulerError> {
        let mut job = self.require_job(job_id).await?;
        job.next_run_time = None;
        self.persist(&job).await?;
        info!(job_id = %job.id, job_name = %job.name, "Job paused");
        Ok(job)
    }

    /// Resume a paused job from its trigger's next fire time.
    ///
    /// A job whose trigger is exhausted is removed and `None` is returned.
    #[instrument(skip(self))]
    pub async fn resume_job(&self, job_id: &str) -> Result<Option<Job>, SchedulerError> {
        let mut job = self.require_job(job_id).await?;
        let now = Utc::now();

        match job.trigger.next_fire_time(None, now)? {
            Some(next) => {
                job.next_run_time = Some(next);
                self.persist(&job).await?;
                info!(job_id = %job.id, next_run_time = %next, "Job resumed");
                self.wake_if_earlier(job.next_run_time).await;
                Ok(Some(job))
            }
            None => {
                self.store.remove(&job.id).await?;
                info!(job_id = %job.id, "Job has no remaining fire times, removed");
                Ok(None)
            }
        }
    }

    /// Replace a job's trigger and recompute its next fire time
    #[instrument(skip(self, trigger), fields(trigger = trigger.kind()))]
    pub async fn reschedule_job(&self, job_id: &str, trigger: Trigger) -> Result<Job, SchedulerError> {
        trigger.validate()?;
        let mut job = self.require_job(job_id).await?;

        job.next_run_time = trigger.next_fire_time(None, Utc::now())?;
        job.trigger = trigger;
        self.persist(&job).await?;

        info!(job_id = %job.id, next_run_time = ?job.next_run_time, "Job rescheduled");
        self.wake_if_earlier(job.next_run_time).await;
        Ok(job)
    }

    /// Change job options without touching its schedule
    #[instrument(skip(self, changes))]
    pub async fn modify_job(&self, job_id: &str, changes: JobChanges) -> Result<Job, SchedulerError> {
        let mut job = self.require_job(job_id).await?;
        changes.apply(&mut job)?;
        self.persist(&job).await?;
        info!(job_id = %job.id, job_name = %job.name, "Job modified");
        Ok(job)
    }

    #[instrument(skip(self))]
    pub async fn remove_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        if !self.store.remove(job_id).await? {
            return Err(SchedulerError::JobNotFound(job_id.to_string()));
        }
        info!(job_id = %job_id, "Job removed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn remove_all_jobs(&self) -> Result<u64, SchedulerError> {
        let removed = self.store.remove_all().await?;
        info!(removed, "All jobs removed");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Every fire time of `job` that is due at `now`, oldest first.
    ///
    /// A coalescing job jumps straight to its latest due fire. Otherwise at
    /// most `MAX_RUNS_PER_PASS` fires are returned; the rest stay due and are
    /// picked up by the next pass.
    fn pending_run_times(job: &Job, now: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, TriggerError> {
        let Some(first) = job.next_run_time.filter(|first| *first <= now) else {
            return Ok(Vec::new());
        };

        if job.coalesce {
            return Ok(vec![job.trigger.last_due_fire_time(first, now)?]);
        }

        let mut run_times = vec![first];
        let mut run_time = first;
        while run_times.len() < MAX_RUNS_PER_PASS {
            match job.trigger.next_fire_time(Some(run_time), now)? {
                Some(next) if next <= run_time => {
                    return Err(TriggerError::InvalidConfiguration(format!(
                        "fire time {next} does not advance past {run_time}"
                    )));
                }
                Some(next) if next <= now => {
                    run_times.push(next);
                    run_time = next;
                }
                _ => break,
            }
        }
        Ok(run_times)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name))]
    async fn dispatch_job(&self, mut job: Job, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let run_times = match Self::pending_run_times(&job, now) {
            Ok(run_times) => run_times,
            Err(e) => {
                error!(error = %e, "Unable to compute run times, removing job");
                self.store.remove(&job.id).await?;
                return Ok(());
            }
        };

        let Some(&last_run_time) = run_times.last() else {
            return Ok(());
        };

        let mut runs = Vec::with_capacity(run_times.len());
        for run_time in run_times {
            if job.is_misfire(run_time, now) {
                warn!(
                    run_time = %run_time,
                    lateness_seconds = (now - run_time).num_seconds(),
                    "Run time of job was missed"
                );
                telemetry::record_job_missed(&job.id, &job.name);
                self.events.publish(JobEvent::Missed(EventMeta::new(
                    &job.id,
                    &job.name,
                    uuid::Uuid::new_v4().to_string(),
                    run_time,
                )));
            } else {
                runs.push(ScheduledRun::new(run_time));
            }
        }

        if !runs.is_empty() {
            match self.pool.submit(&job, runs.clone()).await {
                Ok(()) => debug!(runs = runs.len(), "Job submitted"),
                Err(ExecutionError::MaxInstancesReached { .. }) => {
                    telemetry::record_job_max_instances(&job.id, &job.name);
                    for run in runs {
                        self.events.publish(JobEvent::MaxInstancesReached(EventMeta::new(
                            &job.id,
                            &job.name,
                            run.instance_id,
                            run.run_time,
                        )));
                    }
                }
                Err(e) => error!(error = %e, "Failed to submit job"),
            }
        }

        match job.trigger.next_fire_time(Some(last_run_time), now) {
            Ok(Some(next)) => {
                job.next_run_time = Some(next);
                match self.store.update(&job).await {
                    Ok(()) => debug!(next_run_time = %next, "Job rescheduled"),
                    // removed while it was being dispatched
                    Err(StoreError::NotFound(_)) => debug!("Job vanished before reschedule"),
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(None) => {
                self.store.remove(&job.id).await?;
                info!("Job has no remaining fire times, removed");
            }
            Err(e) => {
                error!(error = %e, "Unable to compute next fire time, removing job");
                self.store.remove(&job.id).await?;
            }
        }

        Ok(())
    }

    /// Next deadline for the loop: the earliest job, capped by the poll interval
    async fn next_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let cap = now
            + chrono::Duration::from_std(self.config.max_poll_interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        match self.store.get_next_wake_time().await {
            Ok(Some(next)) => next.min(cap),
            Ok(None) => cap,
            Err(e) => {
                error!(error = %e, "Failed to read next wake time");
                cap
            }
        }
    }
}

#[async_trait]
impl Scheduler for SchedulerEngine {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        info!(
            max_poll_interval_seconds = self.config.max_poll_interval.as_secs(),
            max_workers = self.config.max_workers,
            "Starting scheduler engine"
        );

        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            self.begin_cycle().await;
            match self.process_due_jobs(Utc::now()).await {
                Ok(count) if count > 0 => info!(jobs_processed = count, "Processed due jobs"),
                Ok(_) => debug!("No jobs due for execution"),
                Err(e) => error!(error = %e, "Error processing due jobs"),
            }

            let now = Utc::now();
            let deadline = self.next_deadline(now).await;
            *self.planned_wake.lock().await = Some(deadline);
            let sleep_for = (deadline - now).to_std().unwrap_or(Duration::ZERO);

            self.set_state(SchedulerState::Sleeping);
            debug!(wake_at = %deadline, "Scheduler sleeping");

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wakeup.notified() => {
                    debug!("Scheduler woken early");
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        *self.planned_wake.lock().await = None;
        self.set_state(SchedulerState::Stopped);
        self.running.store(false, Ordering::SeqCst);
        info!("Scheduler engine stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), SchedulerError> {
        info!("Stopping scheduler engine");

        let was_running = self.running.load(Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);

        if was_running {
            let mut state_rx = self.state_tx.subscribe();
            let stopped = tokio::time::timeout(
                self.config.shutdown_grace,
                state_rx.wait_for(|state| *state == SchedulerState::Stopped),
            )
            .await
            .is_ok();
            if !stopped {
                warn!("Dispatch loop did not stop within the grace period");
            }
        }

        if !self.pool.wait_idle(self.config.shutdown_grace).await {
            warn!(
                grace_seconds = self.config.shutdown_grace.as_secs(),
                "Jobs still running after the shutdown grace period"
            );
        }

        self.events.flush().await;

        if self.config.clear_store_on_shutdown {
            self.remove_all_jobs().await?;
        }

        self.set_state(SchedulerState::Stopped);
        info!("Scheduler engine stopped gracefully");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn process_due_jobs(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        self.set_state(SchedulerState::ComputingDue);
        let due = match self.store.get_due(now).await {
            Ok(due) => due,
            Err(e) => {
                self.set_state(SchedulerState::Idle);
                return Err(e.into());
            }
        };
        telemetry::update_due_jobs(due.len());

        self.set_state(SchedulerState::Dispatching);
        let count = due.len();
        for job in due {
            let job_id = job.id.clone();
            if let Err(e) = self.dispatch_job(job, now).await {
                error!(job_id = %job_id, error = %e, "Failed to dispatch job");
            }
        }

        self.set_state(SchedulerState::Idle);
        Ok(count)
    }
}
