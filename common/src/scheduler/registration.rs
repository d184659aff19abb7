// Job registration types
//
// A JobSpec is what callers hand to `SchedulerEngine::add_job`; unset options
// fall back to the scheduler's JobDefaults.

use crate::config::JobDefaultsConfig;
use crate::errors::SchedulerError;
use crate::models::{Job, Trigger};
use crate::trigger::FireTimeCalculator;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

/// Derive a stable job id from a job name.
///
/// Two registrations with the same name and no explicit id share an id, so
/// the second silently replaces the first even if it runs different logic.
pub fn derive_job_id(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

/// Options applied when a JobSpec leaves them unset
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefaults {
    pub misfire_grace_time: Option<Duration>,
    pub coalesce: bool,
    pub max_instances: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self::from(&JobDefaultsConfig::default())
    }
}

impl From<&JobDefaultsConfig> for JobDefaults {
    fn from(config: &JobDefaultsConfig) -> Self {
        Self {
            misfire_grace_time: config
                .misfire_grace_time_seconds
                .map(|s| Duration::seconds(s as i64)),
            coalesce: config.coalesce,
            max_instances: config.max_instances,
        }
    }
}

/// How the first fire time of a new job is chosen
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum FirstRun {
    /// Ask the trigger
    #[default]
    FromTrigger,
    At(DateTime<Utc>),
    Paused,
}

/// JobSpec describes a job to register
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: Option<String>,
    pub name: Option<String>,
    pub trigger: Trigger,
    pub callable: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// `Some(None)` disables the misfire check for this job
    pub misfire_grace_time: Option<Option<Duration>>,
    pub coalesce: Option<bool>,
    pub max_instances: Option<u32>,
    pub first_run: FirstRun,
}

impl JobSpec {
    pub fn new(trigger: Trigger, callable: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            trigger,
            callable: callable.into(),
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            misfire_grace_time: None,
            coalesce: None,
            max_instances: None,
            first_run: FirstRun::FromTrigger,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Maximum lateness before a fire is recorded as missed, kept to the millisecond
    pub fn misfire_grace_time(mut self, grace: Duration) -> Self {
        self.misfire_grace_time = Some(Some(grace));
        self
    }

    /// Run late fires no matter how late they are
    pub fn without_misfire_grace_time(mut self) -> Self {
        self.misfire_grace_time = Some(None);
        self
    }

    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = Some(coalesce);
        self
    }

    pub fn max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = Some(max_instances);
        self
    }

    pub fn next_run_time(mut self, at: DateTime<Utc>) -> Self {
        self.first_run = FirstRun::At(at);
        self
    }

    pub fn paused(mut self) -> Self {
        self.first_run = FirstRun::Paused;
        self
    }

    /// Resolve identity and defaults into a job record.
    ///
    /// An explicit id wins; otherwise the id is derived from the name. A JobSpec
    /// with neither is rejected.
    pub fn into_job(self, defaults: &JobDefaults, now: DateTime<Utc>) -> Result<Job, SchedulerError> {
        let id = self.id.filter(|id| !id.is_empty());
        let name = self.name.filter(|name| !name.is_empty());

        let (id, name) = match (id, name) {
            (Some(id), Some(name)) => (id, name),
            (Some(id), None) => (id.clone(), id),
            (None, Some(name)) => (derive_job_id(&name), name),
            (None, None) => return Err(SchedulerError::MissingJobIdentity),
        };

        if self.callable.is_empty() {
            return Err(SchedulerError::InvalidJob(format!(
                "job {name} has no callable"
            )));
        }

        let max_instances = self.max_instances.unwrap_or(defaults.max_instances);
        if max_instances == 0 {
            return Err(SchedulerError::InvalidJob(format!(
                "job {name} must allow at least one running instance"
            )));
        }

        self.trigger.validate()?;

        let next_run_time = match self.first_run {
            FirstRun::FromTrigger => self.trigger.next_fire_time(None, now)?,
            FirstRun::At(at) => Some(at),
            FirstRun::Paused => None,
        };

        Ok(Job {
            id,
            name,
            trigger: self.trigger,
            callable: self.callable,
            args: self.args,
            kwargs: self.kwargs,
            misfire_grace_time: self
                .misfire_grace_time
                .unwrap_or(defaults.misfire_grace_time),
            coalesce: self.coalesce.unwrap_or(defaults.coalesce),
            max_instances,
            next_run_time,
        })
    }
}

/// Option changes applied by `SchedulerEngine::modify_job`
#[derive(Debug, Clone, Default)]
pub struct JobChanges {
    pub name: Option<String>,
    pub callable: Option<String>,
    pub args: Option<Vec<serde_json::Value>>,
    pub kwargs: Option<serde_json::Map<String, serde_json::Value>>,
    pub misfire_grace_time: Option<Option<Duration>>,
    pub coalesce: Option<bool>,
    pub max_instances: Option<u32>,
}

impl JobChanges {
    pub(crate) fn apply(self, job: &mut Job) -> Result<(), SchedulerError> {
        if matches!(self.max_instances, Some(0)) {
            return Err(SchedulerError::InvalidJob(format!(
                "job {} must allow at least one running instance",
                job.name
            )));
        }
        if matches!(self.callable.as_deref(), Some("")) {
            return Err(SchedulerError::InvalidJob(format!(
                "job {} has no callable",
                job.name
            )));
        }

        if let Some(name) = self.name {
            job.name = name;
        }
        if let Some(callable) = self.callable {
            job.callable = callable;
        }
        if let Some(args) = self.args {
            job.args = args;
        }
        if let Some(kwargs) = self.kwargs {
            job.kwargs = kwargs;
        }
        if let Some(grace) = self.misfire_grace_time {
            job.misfire_grace_time = grace;
        }
        if let Some(coalesce) = self.coalesce {
            job.coalesce = coalesce;
        }
        if let Some(max_instances) = self.max_instances {
            job.max_instances = max_instances;
        }
        Ok(())
    }
}
