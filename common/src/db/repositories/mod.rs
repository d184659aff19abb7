// Repository layer for database operations

pub mod execution;
pub mod job;

pub use execution::{ExecutionFilter, ExecutionRepository};
pub use job::JobRepository;
