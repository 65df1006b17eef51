use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use warden_config::WardenConfig;
use warden_ipc::ProgressEvent;
use warden_runtime::{ForkClient, Supervisor};

use crate::settings;

/// Run every configured category until SIGTERM or Ctrl-C, then shut down
pub async fn run(config: &WardenConfig) -> Result<()> {
    let mut builder = Supervisor::builder(settings::supervisor_options(config)?)
        .fork_client(ForkClient::new(settings::fork_options(config)))
        .session(settings::session_manager(&config.session).await?);
    for worker in &config.workers {
        builder = builder.category(settings::category_spec(worker, &config.hints));
    }
    let supervisor = builder.build()?;

    let mut events = supervisor.subscribe_events();
    let listener = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event.event {
                ProgressEvent::DomainEvent { name, .. } => {
                    info!(unit = %event.unit, event = %name, "Domain event")
                }
                ProgressEvent::Evaluation { subject, outcome, .. } => {
                    info!(unit = %event.unit, %subject, %outcome, "Evaluation")
                }
                _ => {}
            }
        }
    });

    supervisor.start().await?;
    info!(categories = ?supervisor.categories(), "Supervisor running");

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        _ = terminate.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to wait for Ctrl-C")?;
            info!("Received Ctrl-C");
        }
    }

    let report = supervisor.shutdown("signal").await;
    listener.abort();

    if !report.survivors.is_empty() || !report.cleanup_failures.is_empty() {
        warn!(
            survivors = ?report.survivors,
            cleanup_failures = ?report.cleanup_failures,
            "Shutdown left work behind"
        );
    }
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}
