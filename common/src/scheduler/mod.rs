// Scheduler module: dispatch loop and job registration

pub mod engine;
pub mod registration;

pub use engine::{Scheduler, SchedulerConfig, SchedulerEngine, SchedulerState};
pub use registration::{derive_job_id, FirstRun, JobChanges, JobDefaults, JobSpec};
