//! Environment handed to spawned workers
//!
//! High level connection hints are mapped onto a fixed set of variable names
//! so every worker reads its endpoints the same way.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Streaming RPC endpoint
pub const ENV_RPC_ENDPOINT: &str = "WARDEN_RPC_ENDPOINT";
/// Data API endpoint
pub const ENV_DATA_ENDPOINT: &str = "WARDEN_DATA_ENDPOINT";
/// Comma separated wallet identifiers
pub const ENV_WALLET_IDS: &str = "WARDEN_WALLET_IDS";
/// Persistence store path
pub const ENV_STORE_PATH: &str = "WARDEN_STORE_PATH";
/// Logical worker name, set by the fork client
pub const ENV_WORKER_NAME: &str = "WARDEN_WORKER_NAME";
/// Payload file of a detached worker
pub const ENV_PAYLOAD_FILE: &str = "WARDEN_PAYLOAD_FILE";

const WALLET_SEPARATOR: &str = ",";

/// Connection hints for one spawn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionHints {
    pub rpc_endpoint: Option<String>,
    pub data_endpoint: Option<String>,
    pub wallet_ids: Vec<String>,
    pub store_path: Option<PathBuf>,
    /// Passed through verbatim
    pub extra: BTreeMap<String, String>,
}

impl ConnectionHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rpc_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.rpc_endpoint = Some(endpoint.into());
        self
    }

    pub fn data_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.data_endpoint = Some(endpoint.into());
        self
    }

    pub fn wallet_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        self.wallet_ids = ids.into_iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Fill unset fields from `base`; extras from `self` win on conflict
    pub fn merged_over(mut self, base: &ConnectionHints) -> Self {
        if self.rpc_endpoint.is_none() {
            self.rpc_endpoint = base.rpc_endpoint.clone();
        }
        if self.data_endpoint.is_none() {
            self.data_endpoint = base.data_endpoint.clone();
        }
        if self.wallet_ids.is_empty() {
            self.wallet_ids = base.wallet_ids.clone();
        }
        if self.store_path.is_none() {
            self.store_path = base.store_path.clone();
        }
        for (key, value) in &base.extra {
            self.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    /// Read the hints back inside a worker process
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Self {
            rpc_endpoint: var(ENV_RPC_ENDPOINT),
            data_endpoint: var(ENV_DATA_ENDPOINT),
            wallet_ids: var(ENV_WALLET_IDS)
                .map(|ids| split_wallet_ids(&ids))
                .unwrap_or_default(),
            store_path: var(ENV_STORE_PATH).map(PathBuf::from),
            extra: BTreeMap::new(),
        }
    }

    /// Reject extra keys the OS cannot carry
    pub fn validate(&self) -> Result<(), String> {
        for key in self.extra.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(format!("invalid environment variable name {:?}", key));
            }
        }
        for value in self.extra.values() {
            if value.contains('\0') {
                return Err("environment values must not contain NUL".to_string());
            }
        }
        Ok(())
    }
}

/// Map hints onto environment variables; unset hints produce no variable
pub fn build_env(hints: &ConnectionHints) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    if let Some(endpoint) = &hints.rpc_endpoint {
        env.insert(ENV_RPC_ENDPOINT.to_string(), endpoint.clone());
    }
    if let Some(endpoint) = &hints.data_endpoint {
        env.insert(ENV_DATA_ENDPOINT.to_string(), endpoint.clone());
    }
    if !hints.wallet_ids.is_empty() {
        env.insert(
            ENV_WALLET_IDS.to_string(),
            hints.wallet_ids.join(WALLET_SEPARATOR),
        );
    }
    if let Some(path) = &hints.store_path {
        env.insert(ENV_STORE_PATH.to_string(), path.to_string_lossy().into_owned());
    }
    for (key, value) in &hints.extra {
        env.insert(key.clone(), value.clone());
    }

    env
}

pub fn split_wallet_ids(joined: &str) -> Vec<String> {
    joined
        .split(WALLET_SEPARATOR)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_env_exact_mapping() {
        let hints = ConnectionHints::new()
            .rpc_endpoint("E1")
            .data_endpoint("E2")
            .wallet_ids([1, 2, 3])
            .store_path("/tmp/x")
            .extra("K", "V");

        let env = build_env(&hints);
        let expected: BTreeMap<String, String> = [
            (ENV_RPC_ENDPOINT, "E1"),
            (ENV_DATA_ENDPOINT, "E2"),
            (ENV_WALLET_IDS, "1,2,3"),
            (ENV_STORE_PATH, "/tmp/x"),
            ("K", "V"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert_eq!(env, expected);
    }

    #[test]
    fn test_empty_hints_produce_no_variables() {
        assert!(build_env(&ConnectionHints::default()).is_empty());
    }

    #[test]
    fn test_merge_prefers_own_values() {
        let base = ConnectionHints::new()
            .rpc_endpoint("base-rpc")
            .wallet_ids(["a", "b"])
            .extra("K", "base")
            .extra("ONLY_BASE", "1");
        let merged = ConnectionHints::new()
            .wallet_ids(["c"])
            .extra("K", "mine")
            .merged_over(&base);

        assert_eq!(merged.rpc_endpoint.as_deref(), Some("base-rpc"));
        assert_eq!(merged.wallet_ids, vec!["c".to_string()]);
        assert_eq!(merged.extra["K"], "mine");
        assert_eq!(merged.extra["ONLY_BASE"], "1");
    }

    #[test]
    fn test_invalid_extra_key() {
        let hints = ConnectionHints::new().extra("A=B", "x");
        assert!(hints.validate().is_err());
    }

    #[test]
    fn test_split_wallet_ids() {
        assert_eq!(split_wallet_ids(" w1, ,w2 "), vec!["w1", "w2"]);
    }
}
