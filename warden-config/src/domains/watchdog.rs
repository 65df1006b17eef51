//! Heartbeat watchdog configuration

use crate::error::ConfigResult;
use crate::validation::{validate_nonzero_duration, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// How often units are evaluated
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Silence after which a unit counts as stale
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,

    /// Minimum spacing between two restarts of the same unit
    #[serde(with = "humantime_serde")]
    pub restart_cooldown: Duration,

    /// Freshly started units are left alone this long
    #[serde(with = "humantime_serde")]
    pub startup_grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(60),
            restart_cooldown: Duration::from_secs(30),
            startup_grace: Duration::from_secs(20),
        }
    }
}

impl Validatable for WatchdogConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_nonzero_duration(self.tick_interval, "tick_interval", self.domain_name())?;
        validate_nonzero_duration(self.stale_after, "stale_after", self.domain_name())?;

        if self.tick_interval > self.stale_after {
            tracing::warn!(
                tick_interval = ?self.tick_interval,
                stale_after = ?self.stale_after,
                "watchdog ticks less often than the stale threshold; restarts will lag"
            );
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "watchdog"
    }
}
