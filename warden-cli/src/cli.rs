//! CLI argument parsing definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "warden", author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the configured worker categories until SIGTERM or Ctrl-C
    Supervise,

    /// Run a built-in worker (spawned by the supervisor or `invoke`)
    Worker {
        #[arg(value_enum)]
        kind: WorkerKind,

        /// Exit after the first reply
        #[arg(long)]
        one_shot: bool,

        /// Heartbeat period for the heartbeat worker
        #[arg(long, value_name = "MS", default_value_t = 1000)]
        interval_ms: u64,

        /// Delay before the crash worker exits
        #[arg(long, value_name = "MS", default_value_t = 200)]
        exit_after_ms: u64,

        /// Exit code of the crash worker
        #[arg(long, default_value_t = 1)]
        exit_code: i32,
    },

    /// Spawn a worker, send it one payload and print the result
    Invoke {
        /// JSON payload
        #[arg(long, value_name = "JSON", default_value = "null")]
        payload: String,

        /// Overrides the configured default timeout
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Hand the payload over in a temp file and return immediately
        #[arg(long)]
        detached: bool,

        /// Executable followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// PID-tag lock operations
    Lock {
        #[command(subcommand)]
        lock_cmd: LockCommands,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerKind {
    /// Echo payloads back; honours `fail`, `panic`, `hang` and `exit` payload keys
    Echo,
    /// Answer calls but never heartbeat
    Silent,
    /// Exit on its own after a delay
    Crash,
    /// Heartbeat periodically
    Heartbeat,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerKind::Echo => "echo",
            WorkerKind::Silent => "silent",
            WorkerKind::Crash => "crash",
            WorkerKind::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Subcommand)]
pub enum LockCommands {
    /// Acquire a tag and hold it until interrupted
    Acquire { tag: String },

    /// Report whether a tag is held and by which pid
    Status { tag: String },

    /// Remove a tag file left behind by a dead process
    Release { tag: String },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Print or write a sample configuration
    Sample {
        /// Output file path (stdout when omitted)
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}
