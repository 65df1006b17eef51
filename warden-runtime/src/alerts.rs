//! Operator-facing service alerts

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{error, info, warn};
use warden_ipc::AlertLevel;

pub const DEFAULT_ALERT_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAlert {
    pub level: AlertLevel,
    pub message: String,
    pub ts: DateTime<Utc>,
}

/// External receiver of alerts (dashboard, pager, ...)
pub trait AlertSink: Send + Sync {
    fn alert(&self, level: AlertLevel, message: &str);
}

/// Capped ring buffer; the oldest alert is dropped when full
pub struct AlertLog {
    capacity: usize,
    entries: Mutex<VecDeque<ServiceAlert>>,
    sink: Option<Arc<dyn AlertSink>>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn push(&self, level: AlertLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            AlertLevel::Info => info!(alert = %message, "Service alert"),
            AlertLevel::Warn => warn!(alert = %message, "Service alert"),
            AlertLevel::Error => error!(alert = %message, "Service alert"),
        }
        if let Some(sink) = &self.sink {
            sink.alert(level, &message);
        }

        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(ServiceAlert {
            level,
            message,
            ts: Utc::now(),
        });
    }

    /// Up to `limit` most recent alerts, newest last
    pub fn recent(&self, limit: usize) -> Vec<ServiceAlert> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(AlertLevel, String)>>);

    impl AlertSink for Collect {
        fn alert(&self, level: AlertLevel, message: &str) {
            self.0.lock().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let log = AlertLog::new(3);
        for i in 0..5 {
            log.push(AlertLevel::Info, format!("alert {i}"));
        }

        let messages: Vec<_> = log.recent(10).into_iter().map(|a| a.message).collect();
        assert_eq!(messages, ["alert 2", "alert 3", "alert 4"]);
        assert_eq!(log.recent(1)[0].message, "alert 4");
    }

    #[test]
    fn test_sink_sees_every_alert() {
        let sink = Arc::new(Collect::default());
        let log = AlertLog::new(1).with_sink(sink.clone());
        log.push(AlertLevel::Warn, "first");
        log.push(AlertLevel::Error, "second");

        assert_eq!(log.len(), 1);
        assert_eq!(
            *sink.0.lock(),
            vec![
                (AlertLevel::Warn, "first".to_string()),
                (AlertLevel::Error, "second".to_string())
            ]
        );
    }
}
