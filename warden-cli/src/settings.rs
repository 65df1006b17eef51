//! Mapping from `WardenConfig` domains onto runtime options

use anyhow::{Context, Result};
use std::sync::Arc;
use warden_config::domains::hints::HintsConfig;
use warden_config::{SessionConfig, WardenConfig, WorkerCategoryConfig};
use warden_resilience::{parse_signal, ShutdownOptions};
use warden_runtime::{
    CategorySpec, ConnectionHints, ForkOptions, RestartPolicy, SessionManager, SessionOptions,
    SupervisorOptions, SystemAnchorSource,
};
use warden_storage::{InMemorySessionStore, JsonFileSessionStore, SessionStore};

pub fn connection_hints(hints: &HintsConfig) -> ConnectionHints {
    ConnectionHints {
        rpc_endpoint: hints.rpc_endpoint.clone(),
        data_endpoint: hints.data_endpoint.clone(),
        wallet_ids: hints.wallet_ids.clone(),
        store_path: hints.store_path.clone(),
        extra: hints.extra.clone(),
    }
}

pub fn fork_options(config: &WardenConfig) -> ForkOptions {
    ForkOptions {
        default_timeout: config.fork.default_timeout,
        stop_grace: config.fork.stop_grace,
        max_frame_bytes: config.fork.max_frame_bytes,
        temp_dir: config.fork.temp_dir.clone(),
        hints: connection_hints(&config.hints),
    }
}

pub fn shutdown_options(config: &WardenConfig) -> Result<ShutdownOptions> {
    let force_signal = parse_signal(&config.shutdown.force_signal)
        .with_context(|| format!("Invalid shutdown.force_signal {}", config.shutdown.force_signal))?;

    Ok(ShutdownOptions {
        grace: config.shutdown.grace,
        wait: config.shutdown.wait,
        force_wait: config.shutdown.force_wait,
        force_signal,
    })
}

pub fn supervisor_options(config: &WardenConfig) -> Result<SupervisorOptions> {
    Ok(SupervisorOptions {
        tick_interval: config.watchdog.tick_interval,
        restart_policy: RestartPolicy::new(
            config.watchdog.stale_after,
            config.watchdog.restart_cooldown,
            config.watchdog.startup_grace,
        ),
        lock_dir: config.locks.dir.clone(),
        stop_grace: config.fork.stop_grace,
        shutdown: shutdown_options(config)?,
        alert_capacity: config.alerts.capacity,
    })
}

pub fn category_spec(worker: &WorkerCategoryConfig, hints: &HintsConfig) -> CategorySpec {
    CategorySpec {
        args: worker.args.clone(),
        wallets: worker.unit_wallets(&hints.wallet_ids),
        pid_tag: worker.pid_tag.clone(),
        payload: worker.payload.clone(),
        restart: worker.restart,
        ..CategorySpec::new(&worker.name, &worker.path)
    }
}

/// Session manager over the configured store: JSON file when a path is set, memory otherwise
pub async fn session_manager(config: &SessionConfig) -> Result<SessionManager> {
    let store: Arc<dyn SessionStore> = match &config.store_path {
        Some(path) => Arc::new(
            JsonFileSessionStore::open(path)
                .await
                .with_context(|| format!("Failed to open session store {}", path.display()))?,
        ),
        None => Arc::new(InMemorySessionStore::new()),
    };

    Ok(SessionManager::new(
        store,
        Arc::new(SystemAnchorSource::new()),
        SessionOptions {
            service_name: config.service_name.clone(),
            anchor_max_attempts: config.anchor_max_attempts,
            anchor_retry_delay: config.anchor_retry_delay,
            anchor_retry_cap: config.anchor_retry_cap,
        },
    ))
}
