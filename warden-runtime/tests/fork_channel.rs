//! Fork client and worker harness talking over an in-memory channel

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use warden_ipc::{sanitize_payload, IpcError, ProgressEvent};
use warden_runtime::{
    CallOptions, ChannelOptions, ForkClient, ForkError, HarnessExit, HarnessOptions,
    MemoryMetricsSink, LifecycleEvent, WorkerHandle, WorkerHandler, WorkerHarness, WorkerStatus,
    WorkerTools,
};

#[derive(Default)]
struct Echo {
    markers: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl WorkerHandler for Echo {
    async fn handle(&self, payload: Value, tools: WorkerTools) -> anyhow::Result<Value> {
        if payload.get("hang").is_some() {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if let Some(reason) = payload.get("fail").and_then(Value::as_str) {
            anyhow::bail!("handler failed: {}", reason);
        }
        tools.domain_event("echoed", payload.clone());
        Ok(json!({ "echo": payload }))
    }

    async fn on_stop(&self, _reason: &str) {
        self.markers.lock().push("stop".to_string());
    }

    async fn on_close(&self) {
        self.markers.lock().push("onClose".to_string());
    }
}

type HarnessTask = JoinHandle<Result<HarnessExit, IpcError>>;

fn connect(harness: WorkerHarness<Echo>) -> (WorkerHandle, HarnessTask) {
    let (parent, child) = tokio::io::duplex(64 * 1024);
    let (child_read, child_write) = tokio::io::split(child);
    let (parent_read, parent_write) = tokio::io::split(parent);

    let task = tokio::spawn(harness.run(child_read, child_write));
    let handle = WorkerHandle::connect("echo", parent_read, parent_write, ChannelOptions::default());
    (handle, task)
}

fn echo_worker(markers: Arc<Mutex<Vec<String>>>) -> (WorkerHandle, HarnessTask) {
    connect(WorkerHarness::new(
        Echo { markers },
        HarnessOptions::new("echo"),
    ))
}

#[tokio::test]
async fn echo_returns_sanitized_payload() {
    let (handle, _task) = echo_worker(Arc::default());
    let payloads = [
        json!(null),
        json!("text"),
        json!([1, 2.5, -3, true]),
        json!({"nested": {"list": [{"a": 1}], "empty": {}}}),
        json!({"lamports": 18_446_744_073_709_551_615u64, "small": 42}),
    ];

    for payload in payloads {
        let result = handle
            .call(sanitize_payload(payload.clone()), CallOptions::new())
            .await
            .unwrap();
        assert_eq!(result["echo"], sanitize_payload(payload));
    }
    assert_eq!(handle.status(), WorkerStatus::Alive);
}

#[tokio::test(start_paused = true)]
async fn timeout_releases_resources_exactly_once() {
    let (handle, _task) = echo_worker(Arc::default());
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();

    let err = handle
        .call(
            json!({"hang": true}),
            CallOptions::new()
                .timeout(Duration::from_millis(50))
                .on_release(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(err.to_string().contains("timed out"));
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(handle.pending_calls(), 0);

    // The worker was not killed and still answers
    assert!(handle.is_alive());
    let result = handle.call(json!(1), CallOptions::new()).await.unwrap();
    assert_eq!(result, json!({"echo": 1}));
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn normal_call_produces_each_marker_once() {
    let markers = Arc::new(Mutex::new(Vec::new()));
    let (handle, task) = echo_worker(markers.clone());
    let client = ForkClient::default();

    let unsubscribe = markers.clone();
    let result = client
        .invoke_handle(
            &handle,
            json!({"n": 7}),
            CallOptions::new().on_release(move || unsubscribe.lock().push("unsubscribe".to_string())),
        )
        .await
        .unwrap();
    assert_eq!(result, json!({"echo": {"n": 7}}));

    let exit = task.await.unwrap().unwrap();
    assert!(matches!(exit, HarnessExit::Stopped { .. }));
    assert_eq!(*markers.lock(), ["unsubscribe", "stop", "onClose"]);
    assert_eq!(handle.status(), WorkerStatus::Stopped);
}

#[tokio::test]
async fn remote_error_is_reconstructed() {
    let (handle, _task) = echo_worker(Arc::default());

    let err = handle
        .call(json!({"fail": "bad mint"}), CallOptions::new())
        .await
        .unwrap_err();
    match err {
        ForkError::Remote(remote) => {
            assert_eq!(remote.message, "handler failed: bad mint");
            assert!(remote.stack.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(handle.is_alive());
}

#[tokio::test]
async fn progress_reaches_subscribers() {
    let (handle, _task) = echo_worker(Arc::default());
    let mut progress = handle.subscribe_progress();

    handle
        .call(json!({"mint": "abc"}), CallOptions::new())
        .await
        .unwrap();

    match progress.recv().await.unwrap() {
        ProgressEvent::DomainEvent { name, payload } => {
            assert_eq!(name, "echoed");
            assert_eq!(payload, json!({"mint": "abc"}));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_fails_pending_call() {
    let markers = Arc::new(Mutex::new(Vec::new()));
    let (handle, task) = echo_worker(markers.clone());

    let caller = handle.clone();
    let pending = tokio::spawn(async move { caller.call(json!({"hang": true}), CallOptions::new()).await });
    while handle.pending_calls() == 0 {
        tokio::task::yield_now().await;
    }

    handle.close_input().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_worker_exit());
    assert_eq!(task.await.unwrap().unwrap(), HarnessExit::Disconnected);
    assert_eq!(*markers.lock(), ["onClose"]);
    assert_eq!(handle.status(), WorkerStatus::Error);
}

#[tokio::test]
async fn invocations_are_instrumented() {
    let sink = Arc::new(MemoryMetricsSink::new());
    let harness = WorkerHarness::new(
        Echo::default(),
        HarnessOptions::new("echo").with_metrics(sink.clone()),
    );
    let (handle, _task) = connect(harness);

    handle.call(json!(1), CallOptions::new().request_id("ok")).await.unwrap();
    handle
        .call(json!({"fail": "x"}), CallOptions::new().request_id("bad"))
        .await
        .unwrap_err();

    let events: Vec<_> = sink
        .events()
        .into_iter()
        .map(|e| (e.event, e.request_id))
        .collect();
    assert_eq!(
        events,
        [
            (LifecycleEvent::Start, "ok".to_string()),
            (LifecycleEvent::Success, "ok".to_string()),
            (LifecycleEvent::Cleanup, "ok".to_string()),
            (LifecycleEvent::Start, "bad".to_string()),
            (LifecycleEvent::Error, "bad".to_string()),
            (LifecycleEvent::Cleanup, "bad".to_string()),
        ]
    );
}
