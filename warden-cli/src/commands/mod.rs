//! Subcommand implementations

pub mod config;
pub mod invoke;
pub mod lock;
pub mod supervise;
pub mod worker;
