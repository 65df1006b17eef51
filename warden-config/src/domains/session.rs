//! Session tracking configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Service instance id sessions are recorded under
    pub service_name: String,

    pub anchor_max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub anchor_retry_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub anchor_retry_cap: Duration,

    /// JSON file backing the session store; sessions are kept in memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_name: "warden".to_string(),
            anchor_max_attempts: 5,
            anchor_retry_delay: Duration::from_millis(500),
            anchor_retry_cap: Duration::from_secs(5),
            store_path: None,
        }
    }
}

impl Validatable for SessionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.service_name, "service_name", self.domain_name())?;
        validate_positive(self.anchor_max_attempts, "anchor_max_attempts", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "session"
    }
}
