//! Fork client configuration

use crate::error::ConfigResult;
use crate::validation::{validate_nonzero_duration, validate_positive, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest accepted IPC frame
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// Applied to one-shot invocations that set no timeout
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Time a worker gets to honour `stop` before SIGTERM
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,

    pub max_frame_bytes: usize,

    /// Directory for detached payload files (system temp when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            temp_dir: None,
        }
    }
}

impl Validatable for ForkConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_nonzero_duration(self.default_timeout, "default_timeout", self.domain_name())?;
        validate_positive(self.max_frame_bytes, "max_frame_bytes", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "fork"
    }
}
