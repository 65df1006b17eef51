//! Resilience patterns for warden
//!
//! Retry policies with backoff, reconnect supervision for the shared
//! streaming connection, and coordinated shutdown of worker processes.

pub mod backoff;
pub mod connection;
pub mod retry;
pub mod shutdown;

// Re-export commonly used types
pub use backoff::{Backoff, BackoffCalculator, BackoffStrategy};
pub use connection::{
    ConnectionError, ConnectionPolicy, ConnectionSupervisor, RestartPermit, StreamConnection,
    StreamConnector, SubscriptionId,
};
pub use retry::{RetryError, RetryExecutor, RetryPolicy, Retryable};
pub use shutdown::{
    parse_signal, pid_alive, send_signal, ShutdownCoordinator, ShutdownError, ShutdownOptions,
    ShutdownReport, ShutdownSignal, TrackedWorker, TrackingId,
};

pub use nix::sys::signal::Signal;
