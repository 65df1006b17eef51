//! Shutdown coordination timing

use crate::error::ConfigResult;
use crate::validation::{validate_enum_choice, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Signals accepted for the force phase, with or without the `SIG` prefix
pub const FORCE_SIGNALS: [&str; 5] = ["SIGKILL", "SIGTERM", "SIGINT", "SIGQUIT", "SIGHUP"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Passed to each worker's stop request
    #[serde(with = "humantime_serde")]
    pub grace: Duration,

    /// How long to wait for workers to exit on their own
    #[serde(with = "humantime_serde")]
    pub wait: Duration,

    /// How long to wait after the force signal
    #[serde(with = "humantime_serde")]
    pub force_wait: Duration,

    pub force_signal: String,
}

impl ShutdownConfig {
    /// Signal name in `SIGXXX` form
    pub fn force_signal_name(&self) -> String {
        let upper = self.force_signal.trim().to_ascii_uppercase();
        if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{}", upper)
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
            wait: Duration::from_secs(5),
            force_wait: Duration::from_secs(2),
            force_signal: "SIGKILL".to_string(),
        }
    }
}

impl Validatable for ShutdownConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_enum_choice(
            &self.force_signal_name(),
            &FORCE_SIGNALS,
            "force_signal",
            self.domain_name(),
        )
    }

    fn domain_name(&self) -> &'static str {
        "shutdown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_signal_prefix_is_optional() {
        let config = ShutdownConfig {
            force_signal: "term".to_string(),
            ..Default::default()
        };
        assert_eq!(config.force_signal_name(), "SIGTERM");
        assert!(config.validate().is_ok());

        let config = ShutdownConfig {
            force_signal: "SIGSTOP".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
