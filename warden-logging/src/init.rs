use crate::daily_file::{DailyFileWriter, RotationPolicy};
use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use warden_config::{LogFormat, LoggingConfig};

/// Keeps the background file writer alive; dropping it flushes pending lines
#[must_use = "dropping the guard stops file logging"]
pub struct WorkerLogGuard {
    _guard: WorkerGuard,
}

impl std::fmt::Debug for WorkerLogGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLogGuard").finish_non_exhaustive()
    }
}

/// Initialize simple tracing for console output on stderr
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Use try_init to avoid panic if global subscriber already set
    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Console logging on stderr plus a daily-rotated file for `worker_name`
///
/// Stdout is never written to: a worker's stdout carries IPC frames.
pub fn init_worker_logging(worker_name: &str, config: &LoggingConfig) -> Result<WorkerLogGuard> {
    let writer = DailyFileWriter::open(
        &config.log_dir,
        worker_name,
        RotationPolicy {
            max_file_bytes: config.max_file_bytes,
            retention_days: config.retention_days,
        },
    )
    .with_context(|| format!("Failed to open log directory {}", config.log_dir.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(writer);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer(config.format, std::io::stderr, true))
        .with(fmt_layer(config.format, file_writer, false))
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    tracing::debug!(worker = %worker_name, dir = %config.log_dir.display(), "file logging enabled");
    Ok(WorkerLogGuard { _guard: guard })
}

fn fmt_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);

    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Text => layer.boxed(),
    }
}
