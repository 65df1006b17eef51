//! IPC protocol definitions and message types
//!
//! Every frame exchanged between the supervisor and a worker process is a
//! [`MessageEnvelope`] wrapping one [`Envelope`]. The envelope fields are
//! flattened into the frame so the wire shape is
//! `{"protocolVersion":1,"timestamp":..,"type":"invoke","requestId":"..",..}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Generate a fresh request id for an outgoing call
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Messages exchanged between the supervisor and a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Parent -> child: run the handler once with `payload`
    Invoke {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default)]
        payload: JsonValue,
    },

    /// Child -> parent: the handler returned
    Result {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default)]
        result: JsonValue,
    },

    /// Child -> parent: the handler failed
    Error {
        #[serde(rename = "requestId")]
        request_id: String,
        error: RemoteError,
    },

    /// Child -> parent: heartbeat or domain event, not correlated with a reply
    Progress {
        #[serde(
            rename = "requestId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        request_id: Option<String>,
        progress: ProgressEvent,
    },

    /// Parent -> child: graceful shutdown request, the process is not killed
    Stop {
        #[serde(default)]
        reason: String,
    },
}

impl Envelope {
    /// Build an invoke envelope
    pub fn invoke(request_id: impl Into<String>, payload: JsonValue) -> Self {
        Envelope::Invoke {
            request_id: request_id.into(),
            payload,
        }
    }

    /// Build a stop envelope
    pub fn stop(reason: impl Into<String>) -> Self {
        Envelope::Stop {
            reason: reason.into(),
        }
    }

    /// Build a progress envelope
    pub fn progress(request_id: Option<String>, progress: ProgressEvent) -> Self {
        Envelope::Progress {
            request_id,
            progress,
        }
    }

    /// Request id this envelope is correlated with, if any
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Envelope::Invoke { request_id, .. }
            | Envelope::Result { request_id, .. }
            | Envelope::Error { request_id, .. } => Some(request_id),
            Envelope::Progress { request_id, .. } => request_id.as_deref(),
            Envelope::Stop { .. } => None,
        }
    }

    /// Short name of the envelope kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Invoke { .. } => "invoke",
            Envelope::Result { .. } => "result",
            Envelope::Error { .. } => "error",
            Envelope::Progress { .. } => "progress",
            Envelope::Stop { .. } => "stop",
        }
    }

    /// Whether this envelope terminates a pending call
    pub fn is_reply(&self) -> bool {
        matches!(self, Envelope::Result { .. } | Envelope::Error { .. })
    }
}

/// Error reconstructed from a failed handler invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Severity of an operator-facing alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Info => write!(f, "info"),
            AlertLevel::Warn => write!(f, "warn"),
            AlertLevel::Error => write!(f, "error"),
        }
    }
}

/// Events a worker emits between or during invocations
///
/// This is a closed set: adding a kind means adding a variant here and a
/// branch in the supervisor's dispatch loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Liveness signal with per-domain counters
    Heartbeat {
        /// Milliseconds since the unix epoch, stamped by the worker
        ts: i64,
        status: String,
        #[serde(default)]
        counters: BTreeMap<String, u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
        /// Set by per-wallet workers so the supervisor can track each wallet
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wallet: Option<String>,
    },

    /// Outcome of one evaluation pass (buy/sell gate, scan, ...)
    Evaluation {
        subject: String,
        outcome: String,
        #[serde(default)]
        details: Map<String, JsonValue>,
    },

    /// Operator-facing alert raised by the worker itself
    Alert { level: AlertLevel, message: String },

    /// Any other domain event, republished to listeners untouched
    DomainEvent {
        name: String,
        #[serde(default)]
        payload: JsonValue,
    },
}

impl ProgressEvent {
    /// Build a heartbeat stamped with the current wall clock
    pub fn heartbeat(status: impl Into<String>, counters: BTreeMap<String, u64>) -> Self {
        ProgressEvent::Heartbeat {
            ts: Utc::now().timestamp_millis(),
            status: status.into(),
            counters,
            note: None,
            wallet: None,
        }
    }

    /// Short name of the event kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Heartbeat { .. } => "heartbeat",
            ProgressEvent::Evaluation { .. } => "evaluation",
            ProgressEvent::Alert { .. } => "alert",
            ProgressEvent::DomainEvent { .. } => "domain_event",
        }
    }
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
