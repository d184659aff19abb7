// Common library for the scheduler: job store, dispatch loop, workers and execution ledger

pub mod admin;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod history;
pub mod jobstore;
pub mod models;
pub mod scheduler;
pub mod telemetry;
pub mod trigger;
pub mod worker;
