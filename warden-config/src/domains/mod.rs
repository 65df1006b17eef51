//! Domain-specific configuration modules

pub mod alerts;
pub mod connection;
pub mod fork;
pub mod hints;
pub mod locks;
pub mod logging;
pub mod session;
pub mod shutdown;
pub mod utils;
pub mod watchdog;
pub mod workers;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Main warden configuration combining all domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WardenConfig {
    pub fork: fork::ForkConfig,

    pub watchdog: watchdog::WatchdogConfig,

    pub connection: connection::ConnectionConfig,

    pub shutdown: shutdown::ShutdownConfig,

    pub session: session::SessionConfig,

    pub logging: logging::LoggingConfig,

    pub locks: locks::LocksConfig,

    pub hints: hints::HintsConfig,

    pub alerts: alerts::AlertsConfig,

    /// Categories the supervisor keeps running
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<workers::WorkerCategoryConfig>,
}

impl WardenConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.fork.validate()?;
        self.watchdog.validate()?;
        self.connection.validate()?;
        self.shutdown.validate()?;
        self.session.validate()?;
        self.logging.validate()?;
        self.locks.validate()?;
        self.hints.validate()?;
        self.alerts.validate()?;

        let mut names = HashSet::new();
        for worker in &self.workers {
            worker.validate()?;
            if !names.insert(worker.name.as_str()) {
                return Err(worker.validation_error(format!(
                    "category {} is defined more than once",
                    worker.name
                )));
            }
        }

        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let mut config = WardenConfig::default();
        config.workers.push(workers::WorkerCategoryConfig {
            args: vec!["worker".to_string(), "heartbeat".to_string()],
            pid_tag: Some("heartbeat".to_string()),
            ..workers::WorkerCategoryConfig::new("heartbeat", "warden")
        });
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
