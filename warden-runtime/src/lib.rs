//! Worker runtime for warden
//!
//! Child side: [`WorkerHarness`] runs a [`WorkerHandler`] behind the envelope
//! protocol. Parent side: [`ForkClient`] spawns workers and hands out
//! [`WorkerHandle`]s; the [`Supervisor`] keeps long-running categories alive
//! with the [`HeartbeatWatchdog`], guards singleton resources with
//! [`PidTag`] locks and brackets each run with a session.

pub mod alerts;
pub mod clock;
pub mod env;
pub mod error;
pub mod fork;
pub mod handle;
pub mod harness;
pub mod instrumentation;
pub mod pid_tag;
pub mod session;
pub mod supervisor;
pub mod watchdog;

// Re-export commonly used types
pub use alerts::{AlertLog, AlertSink, ServiceAlert};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use env::{build_env, split_wallet_ids, ConnectionHints};
pub use error::{ExitInfo, ForkError, LockError, SessionError, SupervisorError};
pub use fork::{DetachedOptions, DetachedWorker, ForkClient, ForkOptions, InvokeOptions, SpawnOptions};
pub use handle::{
    CallOptions, ChannelOptions, ProgressCallback, StopOutcome, WorkerHandle,
    WorkerStatus,
};
pub use harness::{
    install_panic_hook, run_worker_from_env, HarnessExit, HarnessOptions, WorkerHandler,
    WorkerHarness, WorkerTools,
};
pub use instrumentation::{
    Instrumentation, LifecycleEvent, MemoryMetricsSink, MetricEvent, MetricsSink,
    TracingMetricsSink,
};
pub use pid_tag::PidTag;
pub use session::{
    Anchor, FinalizeOverrides, LivenessAnchorSource, SessionManager, SessionOptions,
    SystemAnchorSource,
};
pub use supervisor::{
    CategorySpec, Supervisor, SupervisorBuilder, SupervisorOptions, UnitEvent, UnitSnapshot,
};
pub use watchdog::{HeartbeatRecord, HeartbeatWatchdog, RestartPolicy, UnitKey, UnitTimes};
