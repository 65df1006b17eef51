//! Runtime error types

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use warden_ipc::{IpcError, RemoteError};
use warden_storage::StorageError;

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "channel closed"),
        }
    }
}

/// Errors from spawning or calling a worker
#[derive(Debug, Error)]
pub enum ForkError {
    /// Rejected before anything was spawned or sent
    #[error("Invalid invocation: {0}")]
    Validation(String),

    #[error("Worker {worker} timed out after {timeout_ms}ms waiting for request {request_id}")]
    Timeout {
        worker: String,
        request_id: String,
        timeout_ms: u64,
    },

    #[error("Worker {worker} exited before replying ({exit})")]
    WorkerExit { worker: String, exit: ExitInfo },

    /// The worker's output ended but the process is still running
    #[error("Worker {worker} output channel is closed")]
    ChannelClosed { worker: String },

    #[error("Transport error: {0}")]
    Transport(#[from] IpcError),

    /// The handler failed; message and stack come from the worker
    #[error("{0}")]
    Remote(RemoteError),

    #[error("Failed to spawn {path}: {message}")]
    Spawn { path: PathBuf, message: String },
}

impl ForkError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ForkError::Timeout { .. })
    }

    pub fn is_worker_exit(&self) -> bool {
        matches!(self, ForkError::WorkerExit { .. })
    }

    pub fn is_channel_closed(&self) -> bool {
        matches!(self, ForkError::ChannelClosed { .. })
    }

    /// Whether the worker answered (successfully or not) before the call ended
    pub fn is_remote(&self) -> bool {
        matches!(self, ForkError::Remote(_))
    }
}

/// Pid-tag lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Pid tag {tag} already exists at {}", path.display())]
    AlreadyExists {
        tag: String,
        path: PathBuf,
        owner: Option<u32>,
    },

    #[error("Invalid pid tag {0:?}")]
    InvalidTag(String),

    #[error("Pid tag I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LockError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LockError::AlreadyExists { .. })
    }
}

/// Session lifecycle errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Liveness anchor unavailable after {attempts} attempts: {message}")]
    AnchorUnavailable { attempts: u32, message: String },

    #[error("Session store error: {0}")]
    Store(#[from] StorageError),
}

/// Supervisor errors
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Unknown worker category: {0}")]
    UnknownCategory(String),

    #[error("Category {0} is already registered")]
    DuplicateCategory(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Fork(#[from] ForkError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Session(#[from] SessionError),
}
