// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://cronledger.db` or `sqlite::memory:`
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Upper bound on how long the dispatch loop sleeps between wake-ups
    pub max_poll_interval_seconds: u64,
    /// Global cap on concurrently executing jobs
    pub max_workers: usize,
    /// How long `stop` waits for in-flight executions
    pub shutdown_grace_seconds: u64,
    #[serde(default)]
    pub clear_store_on_shutdown: bool,
    #[serde(default = "default_timezone_name")]
    pub default_timezone: String,
    #[serde(default)]
    pub job_defaults: JobDefaultsConfig,
}

/// Options applied to jobs that do not set their own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaultsConfig {
    /// `None` disables the misfire check
    pub misfire_grace_time_seconds: Option<u64>,
    pub coalesce: bool,
    pub max_instances: u32,
}

impl Default for JobDefaultsConfig {
    fn default() -> Self {
        Self {
            misfire_grace_time_seconds: Some(1),
            coalesce: true,
            max_instances: 1,
        }
    }
}

fn default_timezone_name() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.scheduler.max_poll_interval_seconds == 0 {
            return Err("Scheduler max_poll_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.max_workers == 0 {
            return Err("Scheduler max_workers must be greater than 0".to_string());
        }
        if self.scheduler.job_defaults.max_instances == 0 {
            return Err("Job default max_instances must be greater than 0".to_string());
        }
        if crate::trigger::parse_timezone(&self.scheduler.default_timezone).is_err() {
            return Err(format!(
                "Unknown default timezone: {}",
                self.scheduler.default_timezone
            ));
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://cronledger.db".to_string(),
                max_connections: 5,
                min_connections: 1,
                connect_timeout_seconds: 30,
            },
            scheduler: SchedulerSettings {
                max_poll_interval_seconds: 60,
                max_workers: 10,
                shutdown_grace_seconds: 30,
                clear_store_on_shutdown: false,
                default_timezone: default_timezone_name(),
                job_defaults: JobDefaultsConfig::default(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: None,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_empty_database_url() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_workers() {
        let mut settings = Settings::default();
        settings.scheduler.max_workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_unknown_timezone() {
        let mut settings = Settings::default();
        settings.scheduler.default_timezone = "Nowhere/Special".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_job_defaults_match_scheduler_conventions() {
        let defaults = JobDefaultsConfig::default();
        assert_eq!(defaults.misfire_grace_time_seconds, Some(1));
        assert!(defaults.coalesce);
        assert_eq!(defaults.max_instances, 1);
    }
}
