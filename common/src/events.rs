// Job lifecycle events and the in-process event bus
//
// Events are delivered by a single dispatcher task draining an unbounded
// channel, so listeners see every event in publish order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Fields shared by every lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub struct EventMeta {
    pub job_id: String,
    pub job_name: String,
    /// Unique per fire attempt
    pub instance_id: String,
    pub scheduled_run_time: DateTime<Utc>,
    pub event_time: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(
        job_id: impl Into<String>,
        job_name: impl Into<String>,
        instance_id: impl Into<String>,
        scheduled_run_time: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_name: job_name.into(),
            instance_id: instance_id.into(),
            scheduled_run_time,
            event_time: Utc::now(),
        }
    }
}

/// JobEvent is emitted by the dispatch loop and the worker pool
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Submitted(EventMeta),
    Executed(EventMeta),
    Error {
        meta: EventMeta,
        message: String,
        trace: String,
    },
    Missed(EventMeta),
    MaxInstancesReached(EventMeta),
}

/// Discriminant of [`JobEvent`], used for listener filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Submitted,
    Executed,
    Error,
    Missed,
    MaxInstancesReached,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Submitted => write!(f, "submitted"),
            EventKind::Executed => write!(f, "executed"),
            EventKind::Error => write!(f, "error"),
            EventKind::Missed => write!(f, "missed"),
            EventKind::MaxInstancesReached => write!(f, "max_instances_reached"),
        }
    }
}

impl JobEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            JobEvent::Submitted(meta)
            | JobEvent::Executed(meta)
            | JobEvent::Missed(meta)
            | JobEvent::MaxInstancesReached(meta)
            | JobEvent::Error { meta, .. } => meta,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            JobEvent::Submitted(_) => EventKind::Submitted,
            JobEvent::Executed(_) => EventKind::Executed,
            JobEvent::Error { .. } => EventKind::Error,
            JobEvent::Missed(_) => EventKind::Missed,
            JobEvent::MaxInstancesReached(_) => EventKind::MaxInstancesReached,
        }
    }
}

/// EventListener receives lifecycle events from the bus
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Whether this listener wants events of `kind`
    fn accepts(&self, _kind: EventKind) -> bool {
        true
    }

    /// Handle one event. Errors are logged by the bus and never stop delivery.
    async fn on_event(&self, event: &JobEvent) -> anyhow::Result<()>;
}

enum BusMessage {
    Event(JobEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle for publishing events. Cloning shares the same dispatcher.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl EventBus {
    /// Spawn the dispatcher task with a fixed set of listeners.
    ///
    /// Must be called from within a tokio runtime. The dispatcher exits once
    /// every handle has been dropped.
    pub fn start(listeners: Vec<Arc<dyn EventListener>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    BusMessage::Event(event) => dispatch(&listeners, &event).await,
                    BusMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Event bus dispatcher stopped");
        });

        Self { tx }
    }

    /// Queue an event for delivery
    pub fn publish(&self, event: JobEvent) {
        if self.tx.send(BusMessage::Event(event)).is_err() {
            warn!("Event bus dispatcher is gone, dropping event");
        }
    }

    /// Wait until every event published before this call has been delivered
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(BusMessage::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn dispatch(listeners: &[Arc<dyn EventListener>], event: &JobEvent) {
    let kind = event.kind();
    let meta = event.meta();

    for listener in listeners.iter().filter(|l| l.accepts(kind)) {
        if let Err(e) = listener.on_event(event).await {
            error!(
                listener = listener.name(),
                event = %kind,
                job_id = %meta.job_id,
                instance_id = %meta.instance_id,
                error = %e,
                "Event listener failed"
            );
        }
    }
}
