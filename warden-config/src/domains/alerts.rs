//! Service alert log

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Alerts kept in memory before the oldest are dropped
    pub capacity: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { capacity: 200 }
    }
}

impl Validatable for AlertsConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.capacity, "capacity", self.domain_name())
    }

    fn domain_name(&self) -> &'static str {
        "alerts"
    }
}
