// Execution history listener
// Persists every lifecycle event into the execution ledger

use crate::db::repositories::ExecutionRepository;
use crate::events::{EventListener, JobEvent};
use crate::models::ExecutionStatus;
use async_trait::async_trait;
use std::sync::Arc;

/// Listener that writes one execution record per fire attempt
pub struct HistoryListener {
    executions: Arc<ExecutionRepository>,
}

impl HistoryListener {
    pub fn new(executions: Arc<ExecutionRepository>) -> Self {
        Self { executions }
    }
}

#[async_trait]
impl EventListener for HistoryListener {
    fn name(&self) -> &str {
        "execution_history"
    }

    async fn on_event(&self, event: &JobEvent) -> anyhow::Result<()> {
        let meta = event.meta();

        let (status, trace) = match event {
            JobEvent::Submitted(_) => {
                self.executions
                    .record_submitted(&meta.job_id, &meta.job_name, &meta.instance_id, meta.event_time)
                    .await?;
                return Ok(());
            }
            JobEvent::Executed(_) => (ExecutionStatus::Success, None),
            JobEvent::Error { trace, .. } => (ExecutionStatus::Error, Some(trace.as_str())),
            JobEvent::Missed(_) => (ExecutionStatus::Missed, None),
            JobEvent::MaxInstancesReached(_) => (ExecutionStatus::MaxInstancesReached, None),
        };

        self.executions
            .record_outcome(
                &meta.job_id,
                &meta.job_name,
                &meta.instance_id,
                status,
                meta.event_time,
                trace,
            )
            .await?;

        Ok(())
    }
}
