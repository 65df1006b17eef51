//! Child-side worker harness
//!
//! Wraps a [`WorkerHandler`] and speaks the envelope protocol on its behalf:
//! `invoke` frames become handler calls, handler results and errors become
//! `result`/`error` replies, and [`WorkerTools`] lets the handler emit
//! progress at any time.

use anyhow::Context;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use warden_ipc::{
    new_request_id, sanitize_payload, AlertLevel, Envelope, FramedReader, FramedWriter, IpcError,
    ProgressEvent, RemoteError,
};

use crate::env::{ENV_PAYLOAD_FILE, ENV_WORKER_NAME};
use crate::instrumentation::{Instrumentation, MetricsSink};

/// The unit of work a worker process runs
#[async_trait]
pub trait WorkerHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Value, tools: WorkerTools) -> anyhow::Result<Value>;

    /// Called when the parent sends `stop`, before `on_close`
    async fn on_stop(&self, _reason: &str) {}

    /// Release sockets, timers and files; runs once before the harness returns
    async fn on_close(&self) {}
}

/// Harness settings
#[derive(Clone)]
pub struct HarnessOptions {
    pub worker_name: String,
    /// Exit after the first reply instead of waiting for more invocations
    pub exit_on_complete: bool,
    pub metrics: Option<Arc<dyn MetricsSink>>,
    pub max_frame_bytes: Option<usize>,
    /// Stamped on heartbeats of per-wallet workers
    pub wallet: Option<String>,
}

impl HarnessOptions {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            exit_on_complete: false,
            metrics: None,
            max_frame_bytes: None,
            wallet: None,
        }
    }

    /// Name from `WARDEN_WORKER_NAME`, falling back to `default_name`
    pub fn from_env(default_name: &str) -> Self {
        let name = std::env::var(ENV_WORKER_NAME)
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| default_name.to_string());
        Self::new(name)
    }

    pub fn one_shot(mut self) -> Self {
        self.exit_on_complete = true;
        self
    }

    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn with_wallet(mut self, wallet: impl Into<String>) -> Self {
        self.wallet = Some(wallet.into());
        self
    }
}

/// Handed to the handler for emitting progress
#[derive(Clone)]
pub struct WorkerTools {
    request_id: Option<String>,
    wallet: Option<String>,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl WorkerTools {
    /// Request id of the invocation these tools belong to
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Queue a progress frame; false once the transport is gone
    pub fn progress(&self, event: ProgressEvent) -> bool {
        self.outbox
            .send(Envelope::progress(self.request_id.clone(), event))
            .is_ok()
    }

    pub fn heartbeat(&self, status: impl Into<String>, counters: BTreeMap<String, u64>) -> bool {
        self.heartbeat_with_note(status, counters, None)
    }

    pub fn heartbeat_with_note(
        &self,
        status: impl Into<String>,
        counters: BTreeMap<String, u64>,
        note: Option<String>,
    ) -> bool {
        let mut event = ProgressEvent::heartbeat(status, counters);
        if let ProgressEvent::Heartbeat {
            note: slot_note,
            wallet,
            ..
        } = &mut event
        {
            *slot_note = note;
            *wallet = self.wallet.clone();
        }
        self.progress(event)
    }

    pub fn alert(&self, level: AlertLevel, message: impl Into<String>) -> bool {
        self.progress(ProgressEvent::Alert {
            level,
            message: message.into(),
        })
    }

    pub fn evaluation(
        &self,
        subject: impl Into<String>,
        outcome: impl Into<String>,
        details: Map<String, Value>,
    ) -> bool {
        self.progress(ProgressEvent::Evaluation {
            subject: subject.into(),
            outcome: outcome.into(),
            details,
        })
    }

    pub fn domain_event(&self, name: impl Into<String>, payload: Value) -> bool {
        self.progress(ProgressEvent::DomainEvent {
            name: name.into(),
            payload,
        })
    }

    fn for_request(&self, request_id: &str) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            wallet: self.wallet.clone(),
            outbox: self.outbox.clone(),
        }
    }
}

/// Why the harness returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessExit {
    Stopped { reason: String },
    /// The parent closed the channel
    Disconnected,
    /// One-shot mode finished its invocation
    Completed,
}

pub struct WorkerHarness<H> {
    handler: Arc<H>,
    options: HarnessOptions,
    instrumentation: Instrumentation,
    outbox_tx: mpsc::UnboundedSender<Envelope>,
    outbox_rx: mpsc::UnboundedReceiver<Envelope>,
}

impl<H: WorkerHandler> WorkerHarness<H> {
    pub fn new(handler: H, options: HarnessOptions) -> Self {
        Self::from_arc(Arc::new(handler), options)
    }

    pub fn from_arc(handler: Arc<H>, options: HarnessOptions) -> Self {
        let mut instrumentation = Instrumentation::new(options.worker_name.clone());
        if let Some(sink) = &options.metrics {
            instrumentation = instrumentation.with_sink(sink.clone());
        }
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        Self {
            handler,
            options,
            instrumentation,
            outbox_tx,
            outbox_rx,
        }
    }

    /// Tools not tied to an invocation, for background heartbeats
    pub fn tools(&self) -> WorkerTools {
        WorkerTools {
            request_id: None,
            wallet: self.options.wallet.clone(),
            outbox: self.outbox_tx.clone(),
        }
    }

    pub fn handler(&self) -> Arc<H> {
        self.handler.clone()
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    /// Serve on this process's stdin/stdout
    pub async fn run_stdio(self) -> Result<HarnessExit, IpcError> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve invocations until `stop`, disconnect, or (one-shot) the first reply
    pub async fn run<R, W>(self, reader: R, writer: W) -> Result<HarnessExit, IpcError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let base_tools = self.tools();
        let WorkerHarness {
            handler,
            options,
            instrumentation,
            outbox_tx,
            outbox_rx,
        } = self;
        let name = options.worker_name.clone();

        let mut reader = match options.max_frame_bytes {
            Some(limit) => FramedReader::with_limit(reader, limit),
            None => FramedReader::new(reader),
        };
        let (close_tx, close_rx) = oneshot::channel();
        let writer_task = tokio::spawn(write_loop(
            name.clone(),
            FramedWriter::new(writer),
            outbox_rx,
            close_rx,
        ));

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
        let done_tx = options.exit_on_complete.then_some(done_tx);
        let mut inflight = JoinSet::new();

        info!(worker = %name, one_shot = options.exit_on_complete, "Worker harness ready");

        let exit = loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Ok(Envelope::Invoke { request_id, payload }) => {
                        debug!(worker = %name, %request_id, "Invoke received");
                        inflight.spawn(run_invocation(
                            handler.clone(),
                            instrumentation.clone(),
                            base_tools.for_request(&request_id),
                            request_id,
                            payload,
                            outbox_tx.clone(),
                            done_tx.clone(),
                        ));
                    }
                    Ok(Envelope::Stop { reason }) => {
                        info!(worker = %name, %reason, "Stop requested");
                        break HarnessExit::Stopped { reason };
                    }
                    Ok(other) => {
                        warn!(worker = %name, kind = other.kind(), "Ignoring unexpected envelope");
                    }
                    Err(e) if e.is_frame_local() => {
                        warn!(worker = %name, error = %e, "Skipping unreadable frame");
                    }
                    Err(IpcError::ConnectionClosed) => {
                        info!(worker = %name, "Parent disconnected");
                        break HarnessExit::Disconnected;
                    }
                    Err(e) => {
                        error!(worker = %name, error = %e, "Transport failed");
                        break HarnessExit::Disconnected;
                    }
                },
                Some(()) = done_rx.recv(), if options.exit_on_complete => {
                    break HarnessExit::Completed;
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        error!(worker = %name, error = %e, "Invocation task failed");
                    }
                }
            }
        };

        // Invocations still running get no reply; the parent sees the exit
        inflight.abort_all();
        while inflight.join_next().await.is_some() {}

        if let HarnessExit::Stopped { reason } = &exit {
            if AssertUnwindSafe(handler.on_stop(reason))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(worker = %name, "on_stop panicked");
            }
        }
        if AssertUnwindSafe(handler.on_close())
            .catch_unwind()
            .await
            .is_err()
        {
            error!(worker = %name, "on_close panicked");
        }

        drop(outbox_tx);
        drop(base_tools);
        let _ = close_tx.send(());
        if let Err(e) = writer_task.await {
            error!(worker = %name, error = %e, "Writer task failed");
        }

        info!(worker = %name, exit = ?exit, "Worker harness finished");
        Ok(exit)
    }

    /// Detached mode: read the payload file, delete it, run once
    pub async fn run_detached(self, payload_path: &Path) -> anyhow::Result<Value> {
        let WorkerHarness {
            handler,
            options,
            instrumentation,
            outbox_tx,
            mut outbox_rx,
        } = self;
        let name = options.worker_name.clone();

        let bytes = tokio::fs::read(payload_path)
            .await
            .with_context(|| format!("reading payload file {}", payload_path.display()))?;
        if let Err(e) = tokio::fs::remove_file(payload_path).await {
            warn!(worker = %name, error = %e, "Could not delete payload file");
        }
        let payload: Value = serde_json::from_slice(&bytes).context("parsing payload file")?;

        // Nobody reads progress of a detached worker; keep it in the log
        let drain_name = name.clone();
        let drain = tokio::spawn(async move {
            while let Some(envelope) = outbox_rx.recv().await {
                if let Envelope::Progress { progress, .. } = envelope {
                    debug!(worker = %drain_name, kind = progress.kind(), "Detached progress");
                }
            }
        });

        let request_id = format!("detached-{}", new_request_id());
        let tools = WorkerTools {
            request_id: Some(request_id.clone()),
            wallet: options.wallet.clone(),
            outbox: outbox_tx,
        };

        let started = instrumentation.start(&request_id, &Value::Null);
        let outcome = AssertUnwindSafe(handler.handle(payload, tools))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(Ok(value)) => {
                instrumentation.success(&request_id, &value, started);
                Ok(value)
            }
            Ok(Err(err)) => {
                instrumentation.error(&request_id, &err, started);
                Err(err)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                instrumentation.error(&request_id, &message, started);
                Err(anyhow::anyhow!("worker panicked: {}", message))
            }
        };
        instrumentation.cleanup(&request_id);

        if AssertUnwindSafe(handler.on_close())
            .catch_unwind()
            .await
            .is_err()
        {
            error!(worker = %name, "on_close panicked");
        }
        let _ = drain.await;

        result
    }
}

async fn run_invocation<H: WorkerHandler>(
    handler: Arc<H>,
    instrumentation: Instrumentation,
    tools: WorkerTools,
    request_id: String,
    payload: Value,
    outbox: mpsc::UnboundedSender<Envelope>,
    done: Option<mpsc::UnboundedSender<()>>,
) {
    let started = instrumentation.start(&request_id, &Value::Null);
    let outcome = AssertUnwindSafe(handler.handle(payload, tools))
        .catch_unwind()
        .await;

    let reply = match outcome {
        Ok(Ok(result)) => {
            instrumentation.success(&request_id, &result, started);
            Envelope::Result {
                request_id: request_id.clone(),
                result: sanitize_payload(result),
            }
        }
        Ok(Err(err)) => {
            instrumentation.error(&request_id, &err, started);
            Envelope::Error {
                request_id: request_id.clone(),
                error: remote_error(&err),
            }
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            instrumentation.error(&request_id, &message, started);
            Envelope::Error {
                request_id: request_id.clone(),
                error: RemoteError::new(format!("worker panicked: {}", message)),
            }
        }
    };

    if outbox.send(reply).is_err() {
        warn!(worker = %instrumentation.worker(), %request_id, "Transport gone, reply dropped");
    }
    instrumentation.cleanup(&request_id);

    if let Some(done) = done {
        let _ = done.send(());
    }
}

async fn write_loop<W>(
    name: String,
    mut writer: FramedWriter<W>,
    mut outbox: mpsc::UnboundedReceiver<Envelope>,
    mut close: oneshot::Receiver<()>,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;
            envelope = outbox.recv() => match envelope {
                Some(envelope) => {
                    if !write_one(&name, &mut writer, &envelope).await {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut close => {
                // Flush whatever was queued before closing
                while let Ok(envelope) = outbox.try_recv() {
                    if !write_one(&name, &mut writer, &envelope).await {
                        break;
                    }
                }
                break;
            }
        }
    }

    outbox.close();
    let _ = writer.close().await;
}

/// False when the stream is unusable
async fn write_one<W>(name: &str, writer: &mut FramedWriter<W>, envelope: &Envelope) -> bool
where
    W: AsyncWrite + Unpin + Send,
{
    match writer.send(envelope).await {
        Ok(()) => true,
        Err(e) if e.is_fatal() => {
            warn!(worker = %name, error = %e, "Parent channel closed");
            false
        }
        Err(e) => {
            error!(worker = %name, kind = envelope.kind(), error = %e, "Dropping frame");
            true
        }
    }
}

fn remote_error(err: &anyhow::Error) -> RemoteError {
    RemoteError::new(err.to_string()).with_stack(format!("{:?}", err))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Log panics through tracing instead of the default stderr printer
pub fn install_panic_hook(worker_name: &str) {
    let name = worker_name.to_string();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(
            worker = %name,
            %location,
            "Panic: {}",
            panic_message(info.payload())
        );
    }));
}

/// Entry point for worker binaries
///
/// Runs detached when `WARDEN_PAYLOAD_FILE` is set, otherwise serves stdio.
pub async fn run_worker_from_env<H: WorkerHandler>(
    harness: WorkerHarness<H>,
) -> anyhow::Result<HarnessExit> {
    install_panic_hook(&harness.options().worker_name);

    match std::env::var_os(ENV_PAYLOAD_FILE) {
        Some(path) => {
            let result = harness.run_detached(Path::new(&path)).await?;
            debug!(result = %result, "Detached worker finished");
            Ok(HarnessExit::Completed)
        }
        None => Ok(harness.run_stdio().await?),
    }
}
