//! Built-in workers
//!
//! These back the process-level tests and serve as reference workers for
//! trying out a supervisor configuration.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use warden_runtime::{
    run_worker_from_env, ConnectionHints, HarnessExit, HarnessOptions, WorkerHandler,
    WorkerHarness, WorkerTools,
};

use crate::cli::WorkerKind;

/// File that receives one line per lifecycle hook (`stop`, `onClose`)
pub const ENV_CLEANUP_LOG: &str = "WARDEN_CLEANUP_LOG";

#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub kind: WorkerKind,
    pub one_shot: bool,
    pub interval: Duration,
    pub exit_after: Duration,
    pub exit_code: i32,
}

/// Append a marker line to the cleanup log, if one was requested
pub async fn record_marker(marker: &str) {
    let Some(path) = std::env::var_os(ENV_CLEANUP_LOG).map(PathBuf::from) else {
        return;
    };

    let result = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(format!("{}\n", marker).as_bytes()).await?;
        file.sync_all().await
    }
    .await;

    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to record cleanup marker");
    }
}

/// Echoes payloads back together with the hints it was started with
pub struct EchoWorker {
    hints: ConnectionHints,
}

#[async_trait]
impl WorkerHandler for EchoWorker {
    async fn handle(&self, payload: Value, tools: WorkerTools) -> Result<Value> {
        if let Some(reason) = payload.get("fail").and_then(Value::as_str) {
            bail!("echo failed: {}", reason);
        }
        if let Some(message) = payload.get("panic").and_then(Value::as_str) {
            panic!("{}", message);
        }
        if payload.get("hang").is_some() {
            std::future::pending::<()>().await;
        }
        if let Some(code) = payload.get("exit").and_then(Value::as_i64) {
            std::process::exit(code as i32);
        }

        tools.domain_event("echoed", payload.clone());
        Ok(json!({
            "echo": payload,
            "requestId": tools.request_id(),
            "hints": {
                "rpcEndpoint": self.hints.rpc_endpoint,
                "dataEndpoint": self.hints.data_endpoint,
                "walletIds": self.hints.wallet_ids,
                "storePath": self.hints.store_path,
            },
        }))
    }

    async fn on_stop(&self, _reason: &str) {
        record_marker("stop").await;
    }

    async fn on_close(&self) {
        record_marker("onClose").await;
    }
}

/// Answers calls with `null` and never reports progress
pub struct SilentWorker;

#[async_trait]
impl WorkerHandler for SilentWorker {
    async fn handle(&self, _payload: Value, _tools: WorkerTools) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Heartbeats on a fixed period; calls return the beat count
pub struct HeartbeatWorker {
    beats: Arc<AtomicU64>,
}

#[async_trait]
impl WorkerHandler for HeartbeatWorker {
    async fn handle(&self, _payload: Value, _tools: WorkerTools) -> Result<Value> {
        Ok(json!({ "beats": self.beats.load(Ordering::Relaxed) }))
    }

    async fn on_close(&self) {
        record_marker("onClose").await;
    }
}

fn options_for(kind: WorkerKind, args: &WorkerArgs, hints: &ConnectionHints) -> HarnessOptions {
    let mut options = HarnessOptions::from_env(kind.as_str());
    if args.one_shot {
        options = options.one_shot();
    }
    // Per-wallet units are started with exactly one wallet
    if let [wallet] = hints.wallet_ids.as_slice() {
        options = options.with_wallet(wallet.clone());
    }
    options
}

pub async fn run(args: WorkerArgs) -> Result<()> {
    let hints = ConnectionHints::from_env();
    let options = options_for(args.kind, &args, &hints);
    info!(worker = %options.worker_name, kind = args.kind.as_str(), "Worker starting");

    let exit = match args.kind {
        WorkerKind::Echo => {
            run_worker_from_env(WorkerHarness::new(EchoWorker { hints }, options)).await?
        }
        WorkerKind::Silent => run_worker_from_env(WorkerHarness::new(SilentWorker, options)).await?,
        WorkerKind::Crash => {
            let harness = WorkerHarness::new(SilentWorker, options);
            let (delay, code) = (args.exit_after, args.exit_code);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                warn!(code, "Crash worker exiting");
                std::process::exit(code);
            });
            run_worker_from_env(harness).await?
        }
        WorkerKind::Heartbeat => {
            let beats = Arc::new(AtomicU64::new(0));
            let harness = WorkerHarness::new(
                HeartbeatWorker {
                    beats: beats.clone(),
                },
                options,
            );
            let tools = harness.tools();
            let interval = args.interval;
            let beat_task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let n = beats.fetch_add(1, Ordering::Relaxed) + 1;
                    let counters = BTreeMap::from([("beats".to_string(), n)]);
                    if !tools.heartbeat("ok", counters) {
                        break;
                    }
                }
            });
            let exit = run_worker_from_env(harness).await;
            beat_task.abort();
            exit?
        }
    };

    match exit {
        HarnessExit::Stopped { reason } => info!(%reason, "Worker stopped"),
        other => info!(exit = ?other, "Worker finished"),
    }
    Ok(())
}
