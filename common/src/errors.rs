// Error handling framework
// One enum per concern; store and scheduler errors wrap the lower layers.

use thiserror::Error;

/// Trigger construction and evaluation errors
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid trigger configuration: {0}")]
    InvalidConfiguration(String),
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Job store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Failed to serialize job {job_id}: {reason}")]
    Serialization { job_id: String, reason: String },

    #[error("Failed to restore job {job_id}: {reason}")]
    Deserialization { job_id: String, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Job execution errors raised at the worker boundary
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("No callable registered under '{0}'")]
    CallableNotRegistered(String),

    #[error("Job {job_id} reached its maximum of {max_instances} running instance(s)")]
    MaxInstancesReached { job_id: String, max_instances: u32 },

    #[error("Job panicked: {0}")]
    Panicked(String),
}

/// Scheduler-level errors surfaced to callers of the registration API
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Job name should not be empty when no id is supplied")]
    MissingJobIdentity,

    #[error("Invalid job definition: {0}")]
    InvalidJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    DatabaseError::DuplicateKey(db_err.message().to_string())
                } else if db_err.is_foreign_key_violation() {
                    DatabaseError::ForeignKeyViolation(db_err.message().to_string())
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::MigrationFailed(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.into())
    }
}
