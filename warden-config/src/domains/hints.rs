//! Connection hints handed to every worker through its environment

use crate::error::ConfigResult;
use crate::validation::{validate_url, Validatable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HintsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wallet_ids: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,

    /// Extra variables passed through verbatim
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Validatable for HintsConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(endpoint) = &self.rpc_endpoint {
            validate_url(endpoint, "rpc_endpoint", self.domain_name())?;
        }
        if let Some(endpoint) = &self.data_endpoint {
            validate_url(endpoint, "data_endpoint", self.domain_name())?;
        }
        if self.wallet_ids.iter().any(|id| id.trim().is_empty() || id.contains(',')) {
            return Err(self.validation_error("wallet_ids entries must be non-empty and contain no commas"));
        }
        for key in self.extra.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(self.validation_error(format!(
                    "extra has invalid environment variable name {:?}",
                    key
                )));
            }
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "hints"
    }
}
