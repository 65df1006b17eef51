//! PID-tag lock directory

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    pub dir: PathBuf,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("warden-locks"),
        }
    }
}

impl Validatable for LocksConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(self.validation_error("dir cannot be empty"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "locks"
    }
}
