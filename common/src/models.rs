use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use std::str::FromStr;

// Helper functions for Tz serialization
fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&tz.to_string())
}

fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

// ============================================================================
// Job Models
// ============================================================================

/// Current version of the persisted job state encoding
pub const JOB_STATE_VERSION: u32 = 1;

/// Trigger defines when a job fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires every `interval_seconds`, aligned on `start_date`
    Interval {
        interval_seconds: u64,
        start_date: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_date: Option<DateTime<Utc>>,
    },
    /// Fires on a seconds-precision cron expression evaluated in `timezone`
    Cron {
        expression: String,
        #[serde(serialize_with = "serialize_tz", deserialize_with = "deserialize_tz")]
        timezone: Tz,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_date: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_date: Option<DateTime<Utc>>,
    },
    /// Fires once at `run_date`
    Date { run_date: DateTime<Utc> },
}

/// Job is the in-memory form of a persisted job record
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    /// Name the callable was registered under in the [`JobRegistry`](crate::worker::JobRegistry)
    pub callable: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// `None` means a late fire is always executed
    pub misfire_grace_time: Option<Duration>,
    pub coalesce: bool,
    pub max_instances: u32,
    /// `None` means the job is paused
    pub next_run_time: Option<DateTime<Utc>>,
}

/// JobState is the self-describing record stored in the `job_state` blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub version: u32,
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub callable: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misfire_grace_time_ms: Option<i64>,
    pub coalesce: bool,
    pub max_instances: u32,
    pub next_run_time: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job is paused (never fires)
    pub fn is_paused(&self) -> bool {
        self.next_run_time.is_none()
    }

    /// Encode the job into the opaque blob persisted by job stores
    pub fn to_state_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let state = JobState {
            version: JOB_STATE_VERSION,
            id: self.id.clone(),
            name: self.name.clone(),
            trigger: self.trigger.clone(),
            callable: self.callable.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            misfire_grace_time_ms: self.misfire_grace_time.map(|d| d.num_milliseconds()),
            coalesce: self.coalesce,
            max_instances: self.max_instances,
            next_run_time: self.next_run_time,
        };
        serde_json::to_vec(&state)
    }

    /// Restore a job from its persisted blob.
    ///
    /// Fails on malformed JSON, an unknown encoding version or trigger
    /// parameters that no longer validate.
    pub fn from_state_bytes(bytes: &[u8]) -> Result<Self, String> {
        let state: JobState = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;

        if state.version != JOB_STATE_VERSION {
            return Err(format!("unsupported job state version {}", state.version));
        }

        state.trigger.validate().map_err(|e| e.to_string())?;

        Ok(Self {
            id: state.id,
            name: state.name,
            trigger: state.trigger,
            callable: state.callable,
            args: state.args,
            kwargs: state.kwargs,
            misfire_grace_time: state
                .misfire_grace_time_ms
                .map(|ms| {
                    Duration::try_milliseconds(ms)
                        .ok_or_else(|| format!("misfire grace time of {ms}ms is out of range"))
                })
                .transpose()?,
            coalesce: state.coalesce,
            max_instances: state.max_instances,
            next_run_time: state.next_run_time,
        })
    }

    /// Whether a fire scheduled at `run_time` and observed at `now` is too late to run
    pub fn is_misfire(&self, run_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.misfire_grace_time {
            Some(grace) => now - run_time > grace,
            None => false,
        }
    }
}

// ============================================================================
// Execution Models
// ============================================================================

/// ExecutionStatus is the stable status code of an execution record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Recorded on the Submitted event
    Running,
    Success,
    Error,
    Missed,
    MaxInstancesReached,
}

impl ExecutionStatus {
    /// Human-readable label used by the admin reader
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Success => "Success",
            ExecutionStatus::Error => "Error!",
            ExecutionStatus::Missed => "Missed!",
            ExecutionStatus::MaxInstancesReached => "Max instances reached!",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Success => write!(f, "success"),
            ExecutionStatus::Error => write!(f, "error"),
            ExecutionStatus::Missed => write!(f, "missed"),
            ExecutionStatus::MaxInstancesReached => write!(f, "max_instances_reached"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "error" => Ok(ExecutionStatus::Error),
            "missed" => Ok(ExecutionStatus::Missed),
            "max_instances_reached" => Ok(ExecutionStatus::MaxInstancesReached),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

impl TryFrom<String> for ExecutionStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, String> {
        s.parse()
    }
}

/// ExecutionRecord is one row of the execution history ledger
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
    pub id: i64,
    pub job_id: String,
    pub job_name: String,
    #[sqlx(try_from = "String")]
    pub status: ExecutionStatus,
    pub instance_id: String,
    pub start_tm: DateTime<Utc>,
    pub end_tm: Option<DateTime<Utc>>,
    pub trace_message: Option<String>,
}

impl ExecutionRecord {
    /// Elapsed time between start and end, clamped to zero under clock skew.
    /// `None` while the execution has no end time.
    pub fn duration(&self) -> Option<Duration> {
        self.end_tm
            .map(|end| (end - self.start_tm).max(Duration::zero()))
    }

    /// Duration rendered as `HH:MM:SS`
    pub fn duration_display(&self) -> String {
        format_duration(self.duration().unwrap_or_else(Duration::zero))
    }
}

/// Render a non-negative duration as `HH:MM:SS`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
