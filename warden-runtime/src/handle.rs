//! Parent-side handle to one worker process
//!
//! A [`WorkerHandle`] owns the framed channel to a worker. A reader task
//! routes replies to pending calls by request id and fans out progress
//! events. When the channel ends, pending and later calls fail with
//! [`ForkError::WorkerExit`], or [`ForkError::ChannelClosed`] if the process
//! outlived its output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};
use warden_ipc::{new_request_id, Envelope, FramedReader, FramedWriter, IpcError, ProgressEvent};
use warden_resilience::{send_signal, Signal, TrackedWorker};

use crate::error::{ExitInfo, ForkError};

/// After the channel closes, how long to wait for the process exit status
const EXIT_SETTLE: Duration = Duration::from_secs(5);
const PROGRESS_CAPACITY: usize = 256;

/// Lifecycle of a worker as seen by the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Spawned, nothing received yet
    Starting,
    /// At least one frame received
    Alive,
    /// Exited without being asked to
    Error,
    /// Stop was requested
    Stopped,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Alive => "alive",
            WorkerStatus::Error => "error",
            WorkerStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Result of [`WorkerHandle::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited,
    /// Exited within the grace period
    Graceful,
    /// Exited after SIGTERM
    Terminated,
    StillRunning,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
type ReleaseFn = Box<dyn FnOnce() + Send>;
type Reply = Result<Value, ForkError>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Options for one call on a handle
#[derive(Default)]
pub struct CallOptions {
    /// `None` waits for the reply indefinitely
    pub timeout: Option<Duration>,
    pub request_id: Option<String>,
    on_release: Vec<ReleaseFn>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach a close/unsubscribe handle; it runs exactly once when the call ends
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.on_release.push(Box::new(release));
        self
    }

    pub(crate) fn take_release_handles(&mut self) -> Vec<ReleaseFn> {
        std::mem::take(&mut self.on_release)
    }
}

/// Everything registered for one call, released exactly once
///
/// Holds the pending-reply slot, the exit listener and the caller's release
/// handles. Released explicitly when the call settles, or on drop if the call
/// future is cancelled.
pub struct CallResources {
    shared: Arc<Shared>,
    request_id: String,
    registered: bool,
    exit_listener: Option<watch::Receiver<Option<ExitInfo>>>,
    handles: Vec<ReleaseFn>,
    released: bool,
}

impl CallResources {
    fn new(shared: Arc<Shared>, request_id: String, handles: Vec<ReleaseFn>) -> Self {
        Self {
            shared,
            request_id,
            registered: false,
            exit_listener: None,
            handles,
            released: false,
        }
    }

    /// Release everything; returns false if already released
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;

        if self.registered {
            self.shared.pending.lock().remove(&self.request_id);
            self.registered = false;
        }
        self.exit_listener = None;
        for handle in self.handles.drain(..) {
            handle();
        }
        debug!(worker = %self.shared.name, request_id = %self.request_id, "Call resources released");
        true
    }

    fn last_exit(&self) -> ExitInfo {
        self.exit_listener
            .as_ref()
            .and_then(|rx| *rx.borrow())
            .unwrap_or_default()
    }
}

impl Drop for CallResources {
    fn drop(&mut self) {
        self.release();
    }
}

struct Shared {
    name: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    status: Mutex<WorkerStatus>,
    stop_requested: AtomicBool,
    /// Set under the `pending` lock once the reader stopped
    reader_closed: AtomicBool,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    writer: tokio::sync::Mutex<FramedWriter<BoxedWriter>>,
    exit: watch::Sender<Option<ExitInfo>>,
    progress: broadcast::Sender<ProgressEvent>,
    on_progress: Option<ProgressCallback>,
    last_frame_at: Mutex<Option<DateTime<Utc>>>,
}

impl Shared {
    fn set_status(&self, next: WorkerStatus) {
        let mut status = self.status.lock();
        if *status != next {
            debug!(worker = %self.name, from = %*status, to = %next, "Worker status changed");
            *status = next;
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        *self.last_frame_at.lock() = Some(Utc::now());
        {
            let mut status = self.status.lock();
            if *status == WorkerStatus::Starting {
                *status = WorkerStatus::Alive;
            }
        }

        match envelope {
            Envelope::Result { request_id, result } => self.resolve(&request_id, Ok(result)),
            Envelope::Error { request_id, error } => {
                self.resolve(&request_id, Err(ForkError::Remote(error)))
            }
            Envelope::Progress { progress, .. } => {
                if let Some(callback) = &self.on_progress {
                    callback(progress.clone());
                }
                // Nobody listening is fine
                let _ = self.progress.send(progress);
            }
            other => {
                warn!(worker = %self.name, kind = other.kind(), "Unexpected envelope from worker");
            }
        }
    }

    fn resolve(&self, request_id: &str, reply: Reply) {
        match self.pending.lock().remove(request_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => {
                debug!(worker = %self.name, request_id, "Reply for a call that is no longer pending");
            }
        }
    }

    fn mark_reader_closed(&self) {
        let _pending = self.pending.lock();
        self.reader_closed.store(true, Ordering::SeqCst);
    }

    fn fail_pending(&self, exit: Option<ExitInfo>) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (request_id, tx) in pending {
            debug!(worker = %self.name, %request_id, "Failing pending call, channel ended");
            let _ = tx.send(Err(self.closed_error(exit)));
        }
    }

    fn closed_error(&self, exit: Option<ExitInfo>) -> ForkError {
        match exit {
            Some(exit) => ForkError::WorkerExit {
                worker: self.name.clone(),
                exit,
            },
            None => ForkError::ChannelClosed {
                worker: self.name.clone(),
            },
        }
    }

    fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }
}

/// Where the exit status comes from
pub(crate) enum ExitSource {
    /// In-process channel: the end of the stream is the exit
    Channel,
    Process(Child),
}

/// Per-channel settings
#[derive(Clone, Default)]
pub struct ChannelOptions {
    pub max_frame_bytes: Option<usize>,
    pub on_progress: Option<ProgressCallback>,
}

/// Parent-side handle; cheap to clone
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// Attach to a worker speaking the envelope protocol over `reader`/`writer`
    ///
    /// Used directly for in-process workers; the fork client uses it for
    /// spawned processes.
    pub fn connect<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        options: ChannelOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(name.into(), None, reader, writer, options, ExitSource::Channel)
    }

    pub(crate) fn start<R, W>(
        name: String,
        pid: Option<u32>,
        reader: R,
        writer: W,
        options: ChannelOptions,
        exit_source: ExitSource,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (exit, _) = watch::channel(None);
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        let boxed: BoxedWriter = Box::new(writer);

        let shared = Arc::new(Shared {
            name,
            pid,
            started_at: Utc::now(),
            status: Mutex::new(WorkerStatus::Starting),
            stop_requested: AtomicBool::new(false),
            reader_closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(FramedWriter::new(boxed)),
            exit,
            progress,
            on_progress: options.on_progress,
            last_frame_at: Mutex::new(None),
        });

        let process_mode = matches!(exit_source, ExitSource::Process(_));
        if let ExitSource::Process(mut child) = exit_source {
            let waiter = shared.clone();
            tokio::spawn(async move {
                let info = match child.wait().await {
                    Ok(status) => ExitInfo::from_status(status),
                    Err(e) => {
                        warn!(worker = %waiter.name, error = %e, "Failed to wait for worker");
                        ExitInfo::default()
                    }
                };
                debug!(worker = %waiter.name, exit = %info, "Worker process exited");
                waiter.exit.send_replace(Some(info));
            });
        }

        let framed = match options.max_frame_bytes {
            Some(limit) => FramedReader::with_limit(reader, limit),
            None => FramedReader::new(reader),
        };
        tokio::spawn(read_loop(shared.clone(), framed, process_mode));

        Self { shared }
    }

    pub fn worker_name(&self) -> &str {
        &self.shared.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    pub fn status(&self) -> WorkerStatus {
        *self.shared.status.lock()
    }

    /// When the last frame of any kind arrived
    pub fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_frame_at.lock()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.exit_info().is_none()
    }

    /// Whether replies can still arrive; false once the worker's output ended
    pub fn is_connected(&self) -> bool {
        !self.shared.reader_closed.load(Ordering::SeqCst)
    }

    /// Whether `stop` was called; an exit after that is expected
    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.shared.exit_info()
    }

    /// Number of calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.progress.subscribe()
    }

    /// Write one envelope to the worker
    pub async fn send(&self, envelope: &Envelope) -> Result<(), IpcError> {
        self.shared.writer.lock().await.send(envelope).await
    }

    /// Invoke the worker's handler once and wait for its reply
    ///
    /// Exactly one of reply, remote error, timeout or worker exit settles the
    /// call, and all resources registered for it are released exactly once.
    /// A timeout leaves the worker running.
    pub async fn call(&self, payload: Value, mut options: CallOptions) -> Result<Value, ForkError> {
        let request_id = options.request_id.take().unwrap_or_else(new_request_id);
        let mut resources =
            CallResources::new(self.shared.clone(), request_id.clone(), options.take_release_handles());

        if request_id.trim().is_empty() {
            return Err(ForkError::Validation("request id must not be empty".to_string()));
        }
        if let Some(exit) = self.shared.exit_info() {
            return Err(ForkError::WorkerExit {
                worker: self.shared.name.clone(),
                exit,
            });
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if self.shared.reader_closed.load(Ordering::SeqCst) {
                return Err(self.shared.closed_error(self.shared.exit_info()));
            }
            if pending.contains_key(&request_id) {
                return Err(ForkError::Validation(format!(
                    "request id {} is already pending",
                    request_id
                )));
            }
            pending.insert(request_id.clone(), tx);
        }
        resources.registered = true;
        resources.exit_listener = Some(self.shared.exit.subscribe());

        self.send(&Envelope::invoke(request_id.clone(), payload)).await?;
        debug!(worker = %self.shared.name, %request_id, "Invoke sent");

        let reply = match options.timeout {
            Some(limit) => {
                tokio::select! {
                    reply = rx => reply,
                    _ = tokio::time::sleep(limit) => {
                        warn!(
                            worker = %self.shared.name,
                            %request_id,
                            timeout_ms = limit.as_millis() as u64,
                            "Call timed out"
                        );
                        resources.release();
                        return Err(ForkError::Timeout {
                            worker: self.shared.name.clone(),
                            request_id,
                            timeout_ms: limit.as_millis() as u64,
                        });
                    }
                }
            }
            None => rx.await,
        };

        let outcome = match reply {
            Ok(reply) => reply,
            // The reader went away without draining; report the exit we know of
            Err(_) => Err(ForkError::WorkerExit {
                worker: self.shared.name.clone(),
                exit: resources.last_exit(),
            }),
        };
        resources.release();
        outcome
    }

    /// Send `stop`, wait `grace`, then SIGTERM if the worker is still alive
    pub async fn stop(&self, reason: &str, grace: Duration) -> StopOutcome {
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        if !self.is_alive() {
            self.shared.set_status(WorkerStatus::Stopped);
            return StopOutcome::AlreadyExited;
        }
        self.shared.set_status(WorkerStatus::Stopped);

        if let Err(e) = self.send(&Envelope::stop(reason)).await {
            debug!(worker = %self.shared.name, error = %e, "Could not deliver stop");
        }
        if self.wait_exit_timeout(grace).await.is_some() {
            info!(worker = %self.shared.name, reason, "Worker stopped");
            return StopOutcome::Graceful;
        }

        match self.shared.pid {
            Some(pid) => {
                warn!(worker = %self.shared.name, pid, "Worker ignored stop, sending SIGTERM");
                send_signal(pid, Signal::SIGTERM);
            }
            None => {
                let _ = self.shared.writer.lock().await.close().await;
            }
        }

        if self.wait_exit_timeout(grace).await.is_some() {
            StopOutcome::Terminated
        } else {
            warn!(worker = %self.shared.name, "Worker still running after stop");
            StopOutcome::StillRunning
        }
    }

    /// Send a signal to the worker process; false for in-process workers
    pub fn kill(&self, signal: Signal) -> bool {
        match self.shared.pid {
            Some(pid) if self.is_alive() => send_signal(pid, signal),
            _ => false,
        }
    }

    /// Wait until the worker has exited
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.shared.exit.subscribe();
        let settled = rx.wait_for(Option::is_some).await.ok().and_then(|info| *info);
        settled.unwrap_or_default()
    }

    pub async fn wait_exit_timeout(&self, limit: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(limit, self.wait_exit()).await.ok()
    }

    /// Close the worker's input; long-running workers treat this as disconnect
    pub async fn close_input(&self) {
        let _ = self.shared.writer.lock().await.close().await;
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.shared.name)
            .field("pid", &self.shared.pid)
            .field("status", &self.status())
            .finish()
    }
}

async fn read_loop<R>(shared: Arc<Shared>, mut reader: FramedReader<R>, process_mode: bool)
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        match reader.next().await {
            Ok(envelope) => shared.dispatch(envelope),
            Err(e) if e.is_frame_local() => {
                warn!(worker = %shared.name, error = %e, "Skipping unreadable frame");
            }
            Err(IpcError::ConnectionClosed) => {
                debug!(worker = %shared.name, "Worker output closed");
                break;
            }
            Err(e) => {
                warn!(worker = %shared.name, error = %e, "Worker channel failed");
                break;
            }
        }
    }
    shared.mark_reader_closed();

    if !process_mode {
        shared.exit.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(ExitInfo::default());
                true
            } else {
                false
            }
        });
    }

    let mut rx = shared.exit.subscribe();
    let settled = tokio::time::timeout(EXIT_SETTLE, rx.wait_for(Option::is_some))
        .await
        .ok()
        .and_then(|waited| waited.ok().and_then(|info| *info));

    if shared.stop_requested.load(Ordering::SeqCst) {
        shared.set_status(WorkerStatus::Stopped);
    } else {
        match settled {
            Some(exit) => warn!(worker = %shared.name, exit = %exit, "Worker exited unexpectedly"),
            None => warn!(worker = %shared.name, "Worker output closed while the process keeps running"),
        }
        shared.set_status(WorkerStatus::Error);
    }
    shared.fail_pending(settled);
}

#[async_trait]
impl TrackedWorker for WorkerHandle {
    fn name(&self) -> String {
        self.shared.name.clone()
    }

    fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    fn is_alive(&self) -> bool {
        WorkerHandle::is_alive(self)
    }

    async fn request_stop(&self, reason: &str, grace: Duration) {
        let handle = self.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            handle.stop(&reason, grace).await;
        });
    }

    async fn wait_exit(&self) {
        WorkerHandle::wait_exit(self).await;
    }
}
