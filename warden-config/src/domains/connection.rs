//! Streaming connection supervision

use crate::error::ConfigResult;
use crate::validation::{validate_nonzero_duration, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,

    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub min_restart_gap: Duration,

    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Bound on each unsubscribe during a restart
    #[serde(with = "humantime_serde")]
    pub unsubscribe_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            check_interval: Duration::from_secs(5),
            min_restart_gap: Duration::from_secs(5),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            unsubscribe_timeout: Duration::from_secs(2),
        }
    }
}

impl Validatable for ConnectionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_nonzero_duration(self.stale_after, "stale_after", self.domain_name())?;
        validate_nonzero_duration(self.check_interval, "check_interval", self.domain_name())?;

        if self.base_backoff > self.max_backoff {
            return Err(self.validation_error(format!(
                "base_backoff ({:?}) cannot exceed max_backoff ({:?})",
                self.base_backoff, self.max_backoff
            )));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "connection"
    }
}
