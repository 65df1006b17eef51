use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_config::{ConfigLoader, WardenConfig};
use warden_logging::{init_simple_tracing, init_worker_logging, WorkerLogGuard};
use warden_runtime::env::ENV_WORKER_NAME;

mod cli;
mod commands;
mod settings;

use cli::{Cli, Commands};
use commands::invoke::InvokeArgs;
use commands::worker::WorkerArgs;

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<WardenConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                loader
                    .from_file(path)
                    .with_context(|| format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

/// File logging for long-running processes started with a config file, stderr otherwise
fn init_logging(cli: &Cli, config: &WardenConfig) -> Result<Option<WorkerLogGuard>> {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.to_string());

    let process_name = match &cli.command {
        Some(Commands::Supervise) => Some("warden".to_string()),
        Some(Commands::Worker { kind, .. }) => Some(
            std::env::var(ENV_WORKER_NAME)
                .ok()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| kind.as_str().to_string()),
        ),
        _ => None,
    };

    match process_name {
        Some(name) if cli.config.is_some() => {
            let mut logging = config.logging.clone();
            if let Some(level) = cli.log_level.as_deref() {
                logging.level = level
                    .parse()
                    .map_err(|e: String| anyhow::anyhow!(e))?;
            }
            Ok(Some(init_worker_logging(&name, &logging)?))
        }
        _ => {
            init_simple_tracing(&level)?;
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    let _log_guard = init_logging(&cli, &config)?;
    debug!("warden starting");

    match &cli.command {
        Some(Commands::Supervise) => commands::supervise::run(&config).await,
        Some(Commands::Worker {
            kind,
            one_shot,
            interval_ms,
            exit_after_ms,
            exit_code,
        }) => {
            commands::worker::run(WorkerArgs {
                kind: *kind,
                one_shot: *one_shot,
                interval: Duration::from_millis(*interval_ms),
                exit_after: Duration::from_millis(*exit_after_ms),
                exit_code: *exit_code,
            })
            .await
        }
        Some(Commands::Invoke {
            payload,
            timeout_ms,
            detached,
            command,
        }) => {
            commands::invoke::run(
                &config,
                InvokeArgs {
                    payload: payload.clone(),
                    timeout: timeout_ms.map(Duration::from_millis),
                    detached: *detached,
                    command: command.clone(),
                },
            )
            .await
        }
        Some(Commands::Lock { lock_cmd }) => commands::lock::run(&config.locks.dir, lock_cmd).await,
        Some(Commands::Config { config_cmd }) => commands::config::run(&config, config_cmd),
        None => {
            // If no subcommand is provided, print help
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            cmd.print_help().context("Failed to print help")?;
            println!();
            Ok(())
        }
    }
}
