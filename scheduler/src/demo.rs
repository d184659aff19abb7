// Jobs registered by the scheduler binary at startup

use anyhow::Result;
use common::models::Trigger;
use common::scheduler::JobSpec;
use common::worker::{JobInvocation, JobRegistry};
use std::time::Duration;
use tracing::info;

pub const PAYMENT_CHECK: &str = "payments::check";
pub const HEARTBEAT: &str = "ledger::heartbeat";

/// Callables available to stored jobs
pub fn registry() -> JobRegistry {
    JobRegistry::new()
        .register(PAYMENT_CHECK, check_payment)
        .register(HEARTBEAT, heartbeat)
}

async fn check_payment(invocation: JobInvocation) -> Result<()> {
    let account = invocation
        .kwargs
        .get("account")
        .and_then(|v| v.as_str())
        .unwrap_or("default");

    info!(
        job_id = %invocation.job_id,
        instance_id = %invocation.instance_id,
        account,
        "Checking pending payments"
    );
    Ok(())
}

async fn heartbeat(invocation: JobInvocation) -> Result<()> {
    info!(
        instance_id = %invocation.instance_id,
        scheduled_run_time = %invocation.scheduled_run_time,
        "Scheduler heartbeat"
    );
    Ok(())
}

/// Payment check every ten seconds; re-registered by name on every start
pub fn payment_check_job() -> Result<JobSpec> {
    Ok(
        JobSpec::new(Trigger::interval(Duration::from_secs(10))?, PAYMENT_CHECK)
            .name("check_my_payment")
            .kwarg("account", serde_json::json!("default")),
    )
}

/// Hourly heartbeat evaluated in the configured timezone
pub fn heartbeat_job(timezone: &str) -> Result<JobSpec> {
    Ok(JobSpec::new(Trigger::cron("0 0 * * * *", timezone)?, HEARTBEAT).name("ledger_heartbeat"))
}
