use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use warden_runtime::pid_tag::{force_release, read_owner, validate_tag};
use warden_runtime::PidTag;

use crate::cli::LockCommands;

pub async fn run(lock_dir: &Path, command: &LockCommands) -> Result<()> {
    match command {
        LockCommands::Acquire { tag } => acquire(lock_dir, tag).await,
        LockCommands::Status { tag } => status(lock_dir, tag).await,
        LockCommands::Release { tag } => {
            let removed = force_release(tag, lock_dir).await?;
            println!("{}", if removed { "released" } else { "not held" });
            Ok(())
        }
    }
}

async fn acquire(lock_dir: &Path, tag: &str) -> Result<()> {
    let lock = PidTag::acquire(tag, lock_dir).await?;
    println!("acquired {}", lock.path().display());
    info!(tag, "Holding pid tag until interrupted");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    lock.release().await?;
    Ok(())
}

async fn status(lock_dir: &Path, tag: &str) -> Result<()> {
    validate_tag(tag)?;
    let path = lock_dir.join(tag);
    if !tokio::fs::try_exists(&path).await? {
        println!("free");
        return Ok(());
    }
    match read_owner(&path).await {
        Some(pid) => println!("held by {}", pid),
        None => println!("held"),
    }
    Ok(())
}
