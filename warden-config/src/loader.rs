//! Configuration loading and environment variable handling

use crate::domains::hints::HintsConfig;
use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::WardenConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "WARDEN".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<WardenConfig> {
        let content = std::fs::read_to_string(path)?;
        self.from_yaml_str(&content)
    }

    /// Parse YAML text, then apply overrides and validate
    pub fn from_yaml_str(&self, content: &str) -> ConfigResult<WardenConfig> {
        // An empty document is the all-defaults config
        let mut config: WardenConfig = if content.trim().is_empty() {
            WardenConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<WardenConfig> {
        let mut config = WardenConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<WardenConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut WardenConfig) -> ConfigResult<()> {
        self.apply_logging_overrides(&mut config.logging)?;
        self.apply_hints_overrides(&mut config.hints);

        if let Some(dir) = self.get_env_var("LOCK_DIR") {
            config.locks.dir = PathBuf::from(dir);
        }

        if let Some(name) = self.get_env_var("SERVICE_NAME") {
            config.session.service_name = name;
        }

        if let Some(timeout) = self.get_env_var("FORK_TIMEOUT_SECONDS") {
            let seconds: u64 = timeout.trim().parse().map_err(|e| {
                ConfigError::EnvError(format!("Invalid {}_FORK_TIMEOUT_SECONDS: {}", self.prefix, e))
            })?;
            config.fork.default_timeout = Duration::from_secs(seconds);
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Some(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Some(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        if let Some(dir) = self.get_env_var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        Ok(())
    }

    /// Apply connection hint overrides
    fn apply_hints_overrides(&self, config: &mut HintsConfig) {
        if let Some(endpoint) = self.get_env_var("RPC_ENDPOINT") {
            config.rpc_endpoint = Some(endpoint);
        }

        if let Some(endpoint) = self.get_env_var("DATA_ENDPOINT") {
            config.data_endpoint = Some(endpoint);
        }

        if let Some(ids) = self.get_env_var("WALLET_IDS") {
            config.wallet_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(path) = self.get_env_var("STORE_PATH") {
            config.store_path = Some(PathBuf::from(path));
        }
    }

    /// Get a non-empty environment variable with prefix
    fn get_env_var(&self, name: &str) -> Option<String> {
        std::env::var(format!("{}_{}", self.prefix, name))
            .ok()
            .filter(|value| !value.is_empty())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
