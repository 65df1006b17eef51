//! Long-running worker categories

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCategoryConfig {
    pub name: String,

    /// Executable to spawn
    pub path: PathBuf,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Run one unit per wallet; `wallets` falls back to `hints.wallet_ids`
    #[serde(default = "crate::domains::utils::default_false")]
    pub per_wallet: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wallets: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_tag: Option<String>,

    /// Sent to the worker as its first invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default = "crate::domains::utils::default_true")]
    pub restart: bool,
}

impl WorkerCategoryConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args: Vec::new(),
            per_wallet: false,
            wallets: Vec::new(),
            pid_tag: None,
            payload: None,
            restart: true,
        }
    }

    /// Wallets this category fans out over; empty means a single unit
    pub fn unit_wallets(&self, default_wallets: &[String]) -> Vec<String> {
        if !self.per_wallet {
            return Vec::new();
        }
        if self.wallets.is_empty() {
            default_wallets.to_vec()
        } else {
            self.wallets.clone()
        }
    }
}

impl Validatable for WorkerCategoryConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.name, "name", self.domain_name())?;

        if self.path.as_os_str().is_empty() {
            return Err(self.validation_error(format!("category {} has an empty path", self.name)));
        }

        if let Some(tag) = &self.pid_tag {
            let valid = !tag.is_empty()
                && tag != "."
                && tag != ".."
                && !tag.contains(['/', '\\', '\0']);
            if !valid {
                return Err(self.validation_error(format!(
                    "category {} has invalid pid_tag {:?}",
                    self.name, tag
                )));
            }
        }

        if !self.wallets.is_empty() && !self.per_wallet {
            tracing::warn!(
                category = %self.name,
                "wallets listed but per_wallet is false; running a single unit"
            );
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "workers"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_wallets_fall_back_to_hints() {
        let defaults = vec!["w1".to_string(), "w2".to_string()];

        let single = WorkerCategoryConfig::new("scanner", "/usr/bin/scanner");
        assert!(single.unit_wallets(&defaults).is_empty());

        let fanned = WorkerCategoryConfig {
            per_wallet: true,
            ..WorkerCategoryConfig::new("seller", "/usr/bin/seller")
        };
        assert_eq!(fanned.unit_wallets(&defaults), defaults);

        let explicit = WorkerCategoryConfig {
            per_wallet: true,
            wallets: vec!["w9".to_string()],
            ..WorkerCategoryConfig::new("seller", "/usr/bin/seller")
        };
        assert_eq!(explicit.unit_wallets(&defaults), ["w9"]);
    }

    #[test]
    fn test_pid_tag_with_path_separator_is_rejected() {
        let config = WorkerCategoryConfig {
            pid_tag: Some("../escape".to_string()),
            ..WorkerCategoryConfig::new("buyer", "/usr/bin/buyer")
        };
        assert!(config.validate().is_err());
    }
}
