//! Domain-driven configuration for warden
//!
//! Each functional area (fork client, watchdog, connection supervision,
//! shutdown, sessions, logging, locks, hints, alerts, worker categories) has
//! its own serde struct with defaults and validation. [`ConfigLoader`] reads
//! YAML and applies `WARDEN_*` environment overrides on top.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    alerts::AlertsConfig,
    connection::ConnectionConfig,
    fork::ForkConfig,
    hints::HintsConfig,
    locks::LocksConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    session::SessionConfig,
    shutdown::ShutdownConfig,
    watchdog::WatchdogConfig,
    workers::WorkerCategoryConfig,
    WardenConfig,
};
