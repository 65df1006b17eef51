//! Parent-side fork client
//!
//! Spawns worker executables with a mapped environment, wires their
//! stdin/stdout to a [`WorkerHandle`], and runs one-off invocations.

use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};
use warden_ipc::{sanitize_payload, DEFAULT_MAX_FRAME_BYTES};

use crate::env::{build_env, ConnectionHints, ENV_PAYLOAD_FILE, ENV_WORKER_NAME};
use crate::error::{ExitInfo, ForkError};
use crate::handle::{
    CallOptions, ChannelOptions, ExitSource, ProgressCallback, StopOutcome, WorkerHandle,
};

/// Client-wide settings
#[derive(Debug, Clone)]
pub struct ForkOptions {
    /// Used by `invoke` when the call sets no timeout
    pub default_timeout: Duration,
    /// Grace between `stop` and SIGTERM after a completed invoke
    pub stop_grace: Duration,
    pub max_frame_bytes: usize,
    /// Where detached payload files go; system temp dir when unset
    pub temp_dir: Option<PathBuf>,
    /// Base hints every spawn starts from
    pub hints: ConnectionHints,
}

impl Default for ForkOptions {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            temp_dir: None,
            hints: ConnectionHints::default(),
        }
    }
}

/// How to start one worker process
#[derive(Clone, Default)]
pub struct SpawnOptions {
    /// Defaults to the executable's file stem
    pub name: Option<String>,
    pub args: Vec<String>,
    /// Merged over the client's base hints
    pub hints: ConnectionHints,
    pub on_progress: Option<ProgressCallback>,
    pub current_dir: Option<PathBuf>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn hints(mut self, hints: ConnectionHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Spawn + one call
#[derive(Default)]
pub struct InvokeOptions {
    pub spawn: SpawnOptions,
    pub payload: Value,
    pub call: CallOptions,
}

impl InvokeOptions {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn spawn(mut self, spawn: SpawnOptions) -> Self {
        self.spawn = spawn;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.call = self.call.timeout(timeout);
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.call = self.call.request_id(request_id);
        self
    }

    /// Close/unsubscribe handle run exactly once whatever the outcome
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.call = self.call.on_release(release);
        self
    }
}

/// Fire-and-forget spawn
#[derive(Clone, Default)]
pub struct DetachedOptions {
    pub spawn: SpawnOptions,
    pub payload: Value,
}

/// What is left of a detached spawn
#[derive(Debug, Clone)]
pub struct DetachedWorker {
    pub pid: Option<u32>,
    /// Deleted by the worker once read
    pub payload_path: PathBuf,
}

/// Spawns and talks to worker processes
#[derive(Debug, Clone, Default)]
pub struct ForkClient {
    options: ForkOptions,
}

impl ForkClient {
    pub fn new(options: ForkOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ForkOptions {
        &self.options
    }

    /// Spawn a long-running worker and attach a handle to its stdio
    pub async fn spawn(
        &self,
        path: impl AsRef<Path>,
        options: SpawnOptions,
    ) -> Result<WorkerHandle, ForkError> {
        let path = path.as_ref();
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| worker_name_from_path(path));

        let mut cmd = self.command(path, &name, &options)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| spawn_error(path, e))?;
        let pid = child.id();

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return Err(ForkError::Spawn {
                    path: path.to_path_buf(),
                    message: "worker stdio was not captured".to_string(),
                });
            }
        };

        info!(worker = %name, pid = ?pid, path = %path.display(), "Worker spawned");

        Ok(WorkerHandle::start(
            name,
            pid,
            stdout,
            stdin,
            ChannelOptions {
                max_frame_bytes: Some(self.options.max_frame_bytes),
                on_progress: options.on_progress,
            },
            ExitSource::Process(child),
        ))
    }

    /// Spawn, call once, then stop the worker
    ///
    /// The payload is sanitized first. After a timeout the worker is left
    /// running; the caller decides whether to stop it.
    pub async fn invoke(
        &self,
        path: impl AsRef<Path>,
        options: InvokeOptions,
    ) -> Result<Value, ForkError> {
        let InvokeOptions {
            spawn,
            payload,
            mut call,
        } = options;

        let handle = match self.spawn(path, spawn).await {
            Ok(handle) => handle,
            Err(e) => {
                for release in call.take_release_handles() {
                    release();
                }
                return Err(e);
            }
        };

        self.invoke_handle(&handle, payload, call).await
    }

    /// One call on an existing handle, stopping it once the worker answered
    pub async fn invoke_handle(
        &self,
        handle: &WorkerHandle,
        payload: Value,
        mut call: CallOptions,
    ) -> Result<Value, ForkError> {
        if call.timeout.is_none() {
            call.timeout = Some(self.options.default_timeout);
        }

        let result = handle.call(sanitize_payload(payload), call).await;

        match &result {
            Ok(_) | Err(ForkError::Remote(_)) | Err(ForkError::ChannelClosed { .. }) => {
                let outcome = handle.stop("invocation complete", self.options.stop_grace).await;
                debug!(worker = %handle.worker_name(), outcome = ?outcome, "Worker stopped after invoke");
                if outcome == StopOutcome::StillRunning {
                    warn!(worker = %handle.worker_name(), pid = ?handle.pid(), "Worker ignored stop and SIGTERM");
                }
            }
            Err(ForkError::Timeout { .. }) => {
                warn!(
                    worker = %handle.worker_name(),
                    pid = ?handle.pid(),
                    "Invoke timed out; worker left running"
                );
            }
            Err(_) => {}
        }

        result
    }

    /// Spawn an unsupervised worker, handing it the payload through a temp file
    pub async fn spawn_detached(
        &self,
        path: impl AsRef<Path>,
        options: DetachedOptions,
    ) -> Result<DetachedWorker, ForkError> {
        let path = path.as_ref();
        let name = options
            .spawn
            .name
            .clone()
            .unwrap_or_else(|| worker_name_from_path(path));

        let bytes = serde_json::to_vec(&sanitize_payload(options.payload))
            .map_err(|e| ForkError::Validation(e.to_string()))?;
        let temp_dir = self
            .options
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let payload_path = write_payload_file(temp_dir, bytes)
            .await
            .map_err(|e| ForkError::Spawn {
                path: path.to_path_buf(),
                message: format!("writing payload file: {}", e),
            })?;

        let mut cmd = match self.command(path, &name, &options.spawn) {
            Ok(cmd) => cmd,
            Err(e) => {
                remove_payload_file(&payload_path).await;
                return Err(e);
            }
        };
        cmd.env(ENV_PAYLOAD_FILE, &payload_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(false);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_payload_file(&payload_path).await;
                return Err(spawn_error(path, e));
            }
        };
        let pid = child.id();
        info!(worker = %name, pid = ?pid, "Detached worker spawned");

        // Reap it so it does not linger as a zombie
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!(worker = %name, exit = %ExitInfo::from_status(status), "Detached worker exited")
                }
                Err(e) => warn!(worker = %name, error = %e, "Failed to wait for detached worker"),
            }
        });

        Ok(DetachedWorker { pid, payload_path })
    }

    fn command(&self, path: &Path, name: &str, options: &SpawnOptions) -> Result<Command, ForkError> {
        let hints = options.hints.clone().merged_over(&self.options.hints);
        hints.validate().map_err(ForkError::Validation)?;

        let mut cmd = Command::new(path);
        cmd.args(&options.args)
            .envs(build_env(&hints))
            .env(ENV_WORKER_NAME, name);
        if let Some(dir) = &options.current_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

fn worker_name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "worker".to_string())
}

fn spawn_error(path: &Path, err: std::io::Error) -> ForkError {
    ForkError::Spawn {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

async fn write_payload_file(dir: PathBuf, bytes: Vec<u8>) -> std::io::Result<PathBuf> {
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dir)?;
        let mut file = tempfile::Builder::new()
            .prefix("warden-payload-")
            .suffix(".json")
            .tempfile_in(&dir)?;
        file.write_all(&bytes)?;
        file.flush()?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        Ok(path)
    })
    .await
    .map_err(std::io::Error::other)?
}

async fn remove_payload_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove payload file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SH: &str = "/bin/sh";

    /// Shell worker that answers request `fixed` with `{"ok": true}`
    const REPLY_ONCE: &str = r#"read line; printf '%s\n' '{"protocolVersion":1,"timestamp":"2024-05-01T00:00:00Z","type":"result","requestId":"fixed","result":{"ok":true}}'; read rest"#;

    async fn wait_for_file(path: &Path) -> String {
        for _ in 0..100 {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                if !content.is_empty() {
                    return content;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} never appeared", path.display());
    }

    #[test]
    fn test_worker_name_from_path() {
        assert_eq!(worker_name_from_path(Path::new("/opt/bin/buyer")), "buyer");
        assert_eq!(worker_name_from_path(Path::new("scan.sh")), "scan");
        assert_eq!(worker_name_from_path(Path::new("/")), "worker");
    }

    #[tokio::test]
    async fn test_invoke_shell_worker() {
        let client = ForkClient::new(ForkOptions {
            stop_grace: Duration::from_millis(500),
            ..ForkOptions::default()
        });
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();

        let result = client
            .invoke(
                SH,
                InvokeOptions::new(json!({"n": 1}))
                    .spawn(SpawnOptions::new().name("replier").args(["-c", REPLY_ONCE]))
                    .request_id("fixed")
                    .timeout(Duration::from_secs(10))
                    .on_release(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .await
            .unwrap();

        assert_eq!(result, json!({"ok": true}));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_leaves_worker_running() {
        let client = ForkClient::default();
        let handle = client
            .spawn(SH, SpawnOptions::new().name("sleeper").args(["-c", "exec sleep 30"]))
            .await
            .unwrap();

        let err = client
            .invoke_handle(
                &handle,
                json!({}),
                CallOptions::new().timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));
        assert!(handle.is_alive());
        assert_eq!(handle.pending_calls(), 0);

        let outcome = handle.stop("test over", Duration::from_millis(200)).await;
        assert_eq!(outcome, StopOutcome::Terminated);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_worker_exit_fails_call() {
        let client = ForkClient::default();
        let handle = client
            .spawn(SH, SpawnOptions::new().args(["-c", "read line; exit 3"]))
            .await
            .unwrap();

        let err = handle
            .call(json!({}), CallOptions::new().timeout(Duration::from_secs(10)))
            .await
            .unwrap_err();
        match err {
            ForkError::WorkerExit { exit, .. } => assert_eq!(exit.code, Some(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_output_fails_calls_immediately() {
        let client = ForkClient::default();
        let handle = client
            .spawn(
                SH,
                SpawnOptions::new().name("mute").args(["-c", "exec 1>&-; exec sleep 30"]),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.is_connected() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(handle.is_alive());

        let started = std::time::Instant::now();
        let err = handle
            .call(json!({}), CallOptions::new().timeout(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(err.is_channel_closed(), "{err:?}");
        assert!(!err.is_worker_exit());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.pending_calls(), 0);

        handle.stop("test over", Duration::from_millis(200)).await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_spawn_failure_runs_release_handles() {
        let client = ForkClient::default();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();

        let err = client
            .invoke(
                "/nonexistent/warden-worker",
                InvokeOptions::new(json!({})).on_release(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ForkError::Spawn { .. }));
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_extra_env_rejected_before_spawn() {
        let client = ForkClient::default();
        let err = client
            .spawn(
                SH,
                SpawnOptions::new().hints(ConnectionHints::new().extra("BAD=KEY", "v")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ForkError::Validation(_)));
    }

    #[tokio::test]
    async fn test_detached_gets_env_and_payload_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let client = ForkClient::new(ForkOptions {
            temp_dir: Some(dir.path().join("payloads")),
            ..ForkOptions::default()
        });

        let script = r#"printf '%s|%s|%s|%s|%s|%s' "$WARDEN_RPC_ENDPOINT" "$WARDEN_DATA_ENDPOINT" "$WARDEN_WALLET_IDS" "$WARDEN_STORE_PATH" "$K" "$(cat "$WARDEN_PAYLOAD_FILE")" > "$1.tmp" && mv "$1.tmp" "$1""#;
        let hints = ConnectionHints::new()
            .rpc_endpoint("E1")
            .data_endpoint("E2")
            .wallet_ids([1, 2, 3])
            .store_path("/tmp/x")
            .extra("K", "V");

        let detached = client
            .spawn_detached(
                SH,
                DetachedOptions {
                    spawn: SpawnOptions::new()
                        .args(["-c", script, "sh", out.to_str().unwrap()])
                        .hints(hints),
                    payload: json!({"big": 9_007_199_254_740_993u64}),
                },
            )
            .await
            .unwrap();

        assert!(detached.pid.is_some());
        let content = wait_for_file(&out).await;
        assert_eq!(content, r#"E1|E2|1,2,3|/tmp/x|V|{"big":"9007199254740993"}"#);
    }
}
