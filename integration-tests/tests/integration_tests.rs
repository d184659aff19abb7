// Integration tests for the scheduler
// End-to-end workflows over an in-memory SQLite database: store, dispatch
// loop, worker pool, event bus and execution ledger together.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{
    db::repositories::{ExecutionFilter, ExecutionRepository, JobRepository},
    db::DbPool,
    errors::StoreError,
    events::{EventKind, EventListener, EventMeta, JobEvent},
    history::HistoryListener,
    jobstore::JobStore,
    models::{ExecutionStatus, Trigger},
    scheduler::{derive_job_id, Scheduler, SchedulerConfig, SchedulerEngine, JobSpec},
    worker::{JobInvocation, JobRegistry},
};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Listener that keeps every event it sees
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<JobEvent>>,
}

#[async_trait]
impl EventListener for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_event(&self, event: &JobEvent) -> anyhow::Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

impl Recorder {
    async fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().await.iter().map(JobEvent::kind).collect()
    }
}

struct Harness {
    pool: DbPool,
    store: Arc<JobRepository>,
    executions: Arc<ExecutionRepository>,
    recorder: Arc<Recorder>,
    engine: Arc<SchedulerEngine>,
}

/// Helper function to build a scheduler over a fresh in-memory database
async fn setup(registry: JobRegistry, config: SchedulerConfig) -> Harness {
    let pool = DbPool::in_memory()
        .await
        .expect("Failed to open in-memory database");
    let store = Arc::new(JobRepository::new(pool.clone()));
    let executions = Arc::new(ExecutionRepository::new(pool.clone()));
    let recorder = Arc::new(Recorder::default());

    let listeners: Vec<Arc<dyn EventListener>> = vec![
        Arc::new(HistoryListener::new(executions.clone())),
        recorder.clone(),
    ];
    let engine = Arc::new(SchedulerEngine::new(
        config,
        store.clone(),
        registry,
        listeners,
    ));

    Harness {
        pool,
        store,
        executions,
        recorder,
        engine,
    }
}

fn noop_registry() -> JobRegistry {
    JobRegistry::new().register("noop", |_inv: JobInvocation| async { Ok(()) })
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn every(seconds: u64) -> Trigger {
    Trigger::interval_from(t0(), std::time::Duration::from_secs(seconds)).unwrap()
}

async fn history(h: &Harness, job_name: &str) -> Vec<common::models::ExecutionRecord> {
    h.executions
        .find_with_filter(ExecutionFilter {
            job_name: Some(job_name.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_executed_before_submitted_yields_one_success_record() {
    let h = setup(noop_registry(), SchedulerConfig::default()).await;
    let job = h
        .engine
        .add_job(JobSpec::new(every(10), "noop").name("race").paused())
        .await
        .unwrap();

    let listener = HistoryListener::new(h.executions.clone());
    let submitted = EventMeta::new(&job.id, &job.name, "instance-1", t0());
    let executed = EventMeta {
        event_time: submitted.event_time + Duration::seconds(3),
        ..submitted.clone()
    };

    listener.on_event(&JobEvent::Executed(executed)).await.unwrap();
    listener.on_event(&JobEvent::Submitted(submitted.clone())).await.unwrap();

    let records = history(&h, "race").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Success);
    assert_eq!(records[0].start_tm, submitted.event_time);
    assert!(records[0].end_tm.is_some());
    assert_eq!(records[0].duration_display(), "00:00:03");
}

#[tokio::test]
async fn test_update_of_absent_job_fails_and_never_inserts() {
    let h = setup(noop_registry(), SchedulerConfig::default()).await;
    let job = JobSpec::new(every(10), "noop")
        .name("ghost")
        .into_job(h.engine.job_defaults(), t0())
        .unwrap();

    let err = h.store.update(&job).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
    assert!(h.store.lookup(&job.id).await.unwrap().is_none());
    assert!(h.store.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_registration_overwrites_same_id() {
    let h = setup(noop_registry(), SchedulerConfig::default()).await;

    let first = h
        .engine
        .add_job(JobSpec::new(every(10), "noop").name("check_my_payment"))
        .await
        .unwrap();
    let second = h
        .engine
        .add_job(JobSpec::new(every(30), "other").name("check_my_payment"))
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.id, derive_job_id("check_my_payment"));

    let jobs = h.engine.get_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].callable, "other");
}

#[tokio::test]
async fn test_exhausted_one_shot_job_is_removed() {
    let h = setup(noop_registry(), SchedulerConfig::default()).await;
    let job = h
        .engine
        .add_job(JobSpec::new(Trigger::date(t0()), "noop").name("once"))
        .await
        .unwrap();
    assert_eq!(job.next_run_time, Some(t0()));

    h.engine.process_due_jobs(t0()).await.unwrap();
    assert!(h.engine.wait_idle(std::time::Duration::from_secs(5)).await);
    h.engine.flush_events().await;

    assert!(h.store.lookup(&job.id).await.unwrap().is_none());
    assert!(h.store.get_due(t0() + Duration::days(1)).await.unwrap().is_empty());
    assert!(h.store.get_all().await.unwrap().is_empty());

    // the job row is gone, so its history cannot reference it
    assert_eq!(
        h.recorder.kinds().await,
        vec![EventKind::Submitted, EventKind::Executed]
    );
    assert!(history(&h, "once").await.is_empty());
}

#[tokio::test]
async fn test_max_instances_reached_while_first_run_is_held_open() {
    let gate = Arc::new(Notify::new());
    let hold = gate.clone();
    let registry = JobRegistry::new().register("slow", move |_inv: JobInvocation| {
        let hold = hold.clone();
        async move {
            hold.notified().await;
            Ok(())
        }
    });
    let h = setup(registry, SchedulerConfig::default()).await;

    let job = h
        .engine
        .add_job(
            JobSpec::new(every(10), "slow")
                .name("job_a")
                .max_instances(1)
                .next_run_time(t0()),
        )
        .await
        .unwrap();

    h.engine.process_due_jobs(t0()).await.unwrap();
    h.engine
        .process_due_jobs(t0() + Duration::seconds(10))
        .await
        .unwrap();
    h.engine.flush_events().await;

    assert_eq!(
        h.recorder.kinds().await,
        vec![EventKind::Submitted, EventKind::MaxInstancesReached]
    );

    let records = history(&h, "job_a").await;
    let running: Vec<_> = records
        .iter()
        .filter(|r| r.status == ExecutionStatus::Running)
        .collect();
    assert_eq!(running.len(), 1);
    assert_eq!(
        records
            .iter()
            .filter(|r| r.status == ExecutionStatus::MaxInstancesReached)
            .count(),
        1
    );

    // still rescheduled normally
    let stored = h.store.lookup(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_time, Some(t0() + Duration::seconds(20)));

    gate.notify_one();
    assert!(h.engine.wait_idle(std::time::Duration::from_secs(5)).await);
    h.engine.flush_events().await;

    let first = h
        .executions
        .find_by_instance_id(&running[0].instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_late_wake_past_grace_time_is_missed() {
    let h = setup(noop_registry(), SchedulerConfig::default()).await;
    let job = h
        .engine
        .add_job(
            JobSpec::new(every(60), "noop")
                .name("job_b")
                .misfire_grace_time(Duration::seconds(5))
                .next_run_time(t0()),
        )
        .await
        .unwrap();

    h.engine
        .process_due_jobs(t0() + Duration::seconds(20))
        .await
        .unwrap();
    h.engine.flush_events().await;

    assert_eq!(h.recorder.kinds().await, vec![EventKind::Missed]);
    match &h.recorder.events.lock().await[0] {
        JobEvent::Missed(meta) => assert_eq!(meta.scheduled_run_time, t0()),
        other => panic!("expected missed event, got {other:?}"),
    }

    let stored = h.store.lookup(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_time, Some(t0() + Duration::seconds(60)));

    let records = history(&h, "job_b").await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Missed);
    assert_eq!(records[0].status.label(), "Missed!");
}

#[tokio::test]
async fn test_coalesced_backlog_runs_once() {
    let h = setup(noop_registry(), SchedulerConfig::default()).await;
    let job = h
        .engine
        .add_job(
            JobSpec::new(every(10), "noop")
                .name("backlog")
                .without_misfire_grace_time()
                .coalesce(true)
                .next_run_time(t0()),
        )
        .await
        .unwrap();

    h.engine
        .process_due_jobs(t0() + Duration::seconds(45))
        .await
        .unwrap();
    assert!(h.engine.wait_idle(std::time::Duration::from_secs(5)).await);
    h.engine.flush_events().await;

    assert_eq!(
        h.recorder.kinds().await,
        vec![EventKind::Submitted, EventKind::Executed]
    );
    let stored = h.store.lookup(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_time, Some(t0() + Duration::seconds(50)));
}

#[tokio::test]
async fn test_panicking_job_records_error_and_loop_continues() {
    let registry = JobRegistry::new()
        .register("explode", |_inv: JobInvocation| async move {
            if true {
                panic!("ledger exploded");
            }
            Ok(())
        })
        .register("noop", |_inv: JobInvocation| async { Ok(()) });
    let h = setup(registry, SchedulerConfig::default()).await;

    h.engine
        .add_job(JobSpec::new(every(10), "explode").name("bad").next_run_time(t0()))
        .await
        .unwrap();
    h.engine
        .add_job(JobSpec::new(every(10), "noop").name("good").next_run_time(t0()))
        .await
        .unwrap();

    assert_eq!(h.engine.process_due_jobs(t0()).await.unwrap(), 2);
    assert!(h.engine.wait_idle(std::time::Duration::from_secs(5)).await);
    h.engine.flush_events().await;

    let bad = history(&h, "bad").await;
    assert_eq!(bad.len(), 1);
    assert_eq!(bad[0].status, ExecutionStatus::Error);
    assert!(bad[0].trace_message.as_deref().unwrap().contains("ledger exploded"));

    let good = history(&h, "good").await;
    assert_eq!(good[0].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn test_corrupt_job_state_is_pruned_during_dispatch() {
    let h = setup(noop_registry(), SchedulerConfig::default()).await;
    h.engine
        .add_job(JobSpec::new(every(10), "noop").name("healthy").next_run_time(t0()))
        .await
        .unwrap();

    sqlx::query(
        "INSERT INTO scheduled_jobs (id, name, job_state, next_run_time, updated_at, created_at)
         VALUES ('corrupt', 'corrupt', x'deadbeef', ?1, ?2, ?2)",
    )
    .bind(t0().timestamp_micros())
    .bind(Utc::now())
    .execute(h.pool.pool())
    .await
    .unwrap();

    assert_eq!(h.engine.process_due_jobs(t0()).await.unwrap(), 1);

    let remaining: Vec<String> = sqlx::query_scalar("SELECT id FROM scheduled_jobs")
        .fetch_all(h.pool.pool())
        .await
        .unwrap();
    assert_eq!(remaining, vec![derive_job_id("healthy")]);
}

#[tokio::test]
async fn test_removing_job_cascades_to_history() {
    let h = setup(noop_registry(), SchedulerConfig::default()).await;
    let job = h
        .engine
        .add_job(JobSpec::new(every(10), "noop").name("short_lived").next_run_time(t0()))
        .await
        .unwrap();

    h.engine.process_due_jobs(t0()).await.unwrap();
    assert!(h.engine.wait_idle(std::time::Duration::from_secs(5)).await);
    h.engine.flush_events().await;
    assert_eq!(history(&h, "short_lived").await.len(), 1);

    h.engine.remove_job(&job.id).await.unwrap();
    assert!(history(&h, "short_lived").await.is_empty());
}

#[tokio::test]
async fn test_running_loop_picks_up_job_added_later() {
    let ran = Arc::new(Notify::new());
    let signal = ran.clone();
    let registry = JobRegistry::new().register("ping", move |_inv: JobInvocation| {
        let signal = signal.clone();
        async move {
            signal.notify_one();
            Ok(())
        }
    });
    let config = SchedulerConfig {
        max_poll_interval: std::time::Duration::from_secs(3600),
        shutdown_grace: std::time::Duration::from_secs(5),
        ..Default::default()
    };
    let h = setup(registry, config).await;

    let runner = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    // let the loop go to sleep on an empty store before adding the job
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.engine
        .add_job(
            JobSpec::new(Trigger::date(Utc::now()), "ping")
                .name("ping_once")
                .without_misfire_grace_time(),
        )
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), ran.notified())
        .await
        .expect("job did not run after being added to a sleeping scheduler");

    h.engine.stop().await.unwrap();
    runner.await.unwrap().unwrap();
    assert!(h.engine.get_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_clears_store_when_configured() {
    let config = SchedulerConfig {
        clear_store_on_shutdown: true,
        shutdown_grace: std::time::Duration::from_secs(1),
        ..Default::default()
    };
    let h = setup(noop_registry(), config).await;
    h.engine
        .add_job(JobSpec::new(every(10), "noop").name("transient"))
        .await
        .unwrap();

    h.engine.stop().await.unwrap();
    assert!(h.store.get_all().await.unwrap().is_empty());
}
