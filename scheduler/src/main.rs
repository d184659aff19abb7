// Scheduler binary entry point

mod demo;

use anyhow::Context;
use common::config::Settings;
use common::db::repositories::{ExecutionRepository, JobRepository};
use common::db::DbPool;
use common::events::EventListener;
use common::history::HistoryListener;
use common::jobstore::JobStore;
use common::scheduler::{Scheduler, SchedulerConfig, SchedulerEngine};
use common::telemetry;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!("Starting cronledger scheduler");
    info!(
        database_url = %settings.database.url,
        max_workers = settings.scheduler.max_workers,
        "Configuration loaded"
    );

    let db_pool = DbPool::new(&settings.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database pool");
        e
    })?;
    db_pool.migrate().await?;
    db_pool.health_check().await?;

    let store: Arc<dyn JobStore> = Arc::new(JobRepository::new(db_pool.clone()));
    let executions = Arc::new(ExecutionRepository::new(db_pool.clone()));
    let listeners: Vec<Arc<dyn EventListener>> = vec![Arc::new(HistoryListener::new(executions))];

    let scheduler = Arc::new(SchedulerEngine::new(
        SchedulerConfig::from(&settings.scheduler),
        store,
        demo::registry(),
        listeners,
    ));
    info!("Scheduler engine created");

    let payment = scheduler.add_job(demo::payment_check_job()?).await?;
    let heartbeat = scheduler
        .add_job(demo::heartbeat_job(&settings.scheduler.default_timezone)?)
        .await?;
    info!(
        payment_job_id = %payment.id,
        heartbeat_job_id = %heartbeat.id,
        "Demo jobs registered"
    );

    let scheduler_for_shutdown = scheduler.clone();
    let shutdown = tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        if let Err(e) = scheduler_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    if let Err(e) = scheduler.start().await {
        error!(error = %e, "Scheduler error");
        return Err(e.into());
    }

    // stop() keeps flushing history after the loop exits
    shutdown.await?;
    db_pool.close().await;
    telemetry::shutdown_tracer();
    info!("Scheduler stopped");
    Ok(())
}
