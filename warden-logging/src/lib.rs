//! Logging setup for warden processes
//!
//! The supervisor and every worker log through `tracing`. Console output goes
//! to stderr; [`init_worker_logging`] additionally writes each process's
//! events to its own [`DailyFileWriter`].

pub mod daily_file;
pub mod init;

pub use daily_file::{DailyFileWriter, RotationPolicy, DEFAULT_MAX_FILE_BYTES, DEFAULT_RETENTION_DAYS};
pub use init::{init_simple_tracing, init_worker_logging, WorkerLogGuard};
