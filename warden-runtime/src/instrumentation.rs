//! Uniform lifecycle logging and metrics for worker invocations

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::clock::{Clock, SystemClock};

/// Lifecycle stage of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    Start,
    Success,
    Error,
    Cleanup,
}

/// Flat record handed to a [`MetricsSink`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricEvent {
    pub event: LifecycleEvent,
    pub worker: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Receives one record per lifecycle event
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Writes metric records as JSON log lines on the `warden::metrics` target
#[derive(Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, event: MetricEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => info!(target: "warden::metrics", "{}", line),
            Err(e) => error!(target: "warden::metrics", error = %e, "Unserializable metric"),
        }
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&self, event: MetricEvent) {
        self.events.lock().push(event);
    }
}

/// One per worker; every invocation goes start -> success|error -> cleanup
#[derive(Clone)]
pub struct Instrumentation {
    worker: String,
    sink: Option<Arc<dyn MetricsSink>>,
    clock: Arc<dyn Clock>,
}

impl Instrumentation {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            sink: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// Returns the start timestamp to hand back to `success`/`error`
    pub fn start(&self, request_id: &str, meta: &Value) -> i64 {
        let started_at_ms = self.clock.now_ms();
        info!(worker = %self.worker, request_id, "Invocation started");

        let fields = match meta {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("meta".to_string(), other.clone());
                map
            }
        };
        self.emit(LifecycleEvent::Start, request_id, None, fields);
        started_at_ms
    }

    pub fn success(&self, request_id: &str, result: &Value, started_at_ms: i64) {
        let duration_ms = self.elapsed_since(started_at_ms);
        info!(worker = %self.worker, request_id, duration_ms, "Invocation succeeded");

        let mut fields = Map::new();
        fields.insert("resultType".to_string(), Value::from(json_type(result)));
        self.emit(LifecycleEvent::Success, request_id, Some(duration_ms), fields);
    }

    pub fn error(&self, request_id: &str, err: &dyn Display, started_at_ms: i64) {
        let duration_ms = self.elapsed_since(started_at_ms);
        error!(worker = %self.worker, request_id, duration_ms, error = %err, "Invocation failed");

        let mut fields = Map::new();
        fields.insert("error".to_string(), Value::from(err.to_string()));
        self.emit(LifecycleEvent::Error, request_id, Some(duration_ms), fields);
    }

    pub fn cleanup(&self, request_id: &str) {
        debug!(worker = %self.worker, request_id, "Invocation cleaned up");
        self.emit(LifecycleEvent::Cleanup, request_id, None, Map::new());
    }

    fn elapsed_since(&self, started_at_ms: i64) -> i64 {
        self.clock.now_ms() - started_at_ms
    }

    fn emit(
        &self,
        event: LifecycleEvent,
        request_id: &str,
        duration_ms: Option<i64>,
        fields: Map<String, Value>,
    ) {
        if let Some(sink) = &self.sink {
            sink.record(MetricEvent {
                event,
                worker: self.worker.clone(),
                request_id: request_id.to_string(),
                duration_ms,
                fields,
            });
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    #[test]
    fn test_lifecycle_records() {
        let clock = Arc::new(ManualClock::new(10_000));
        let sink = Arc::new(MemoryMetricsSink::new());
        let instrumentation = Instrumentation::new("buyer")
            .with_sink(sink.clone())
            .with_clock(clock.clone());

        let started = instrumentation.start("r1", &json!({"mint": "abc"}));
        clock.advance(250);
        instrumentation.success("r1", &json!({"ok": true}), started);
        instrumentation.cleanup("r1");

        let events = sink.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event, LifecycleEvent::Start);
        assert_eq!(events[0].fields["mint"], "abc");
        assert_eq!(events[1].duration_ms, Some(250));
        assert_eq!(events[2].event, LifecycleEvent::Cleanup);
    }

    #[test]
    fn test_metric_record_is_flat() {
        let clock = Arc::new(ManualClock::new(0));
        let sink = Arc::new(MemoryMetricsSink::new());
        let instrumentation = Instrumentation::new("seller")
            .with_sink(sink.clone())
            .with_clock(clock.clone());

        clock.set(1_000);
        instrumentation.error("r2", &"rpc unavailable", 400);

        let value = serde_json::to_value(&sink.events()[0]).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "error",
                "worker": "seller",
                "requestId": "r2",
                "durationMs": 600,
                "error": "rpc unavailable",
            })
        );
    }

    #[test]
    fn test_no_sink_is_fine() {
        let instrumentation = Instrumentation::new("quiet");
        let started = instrumentation.start("r", &Value::Null);
        instrumentation.success("r", &Value::Null, started);
        instrumentation.cleanup("r");
    }
}
