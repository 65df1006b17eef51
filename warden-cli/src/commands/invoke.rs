use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use warden_config::WardenConfig;
use warden_runtime::{DetachedOptions, ForkClient, InvokeOptions, SpawnOptions};

use crate::settings;

pub struct InvokeArgs {
    pub payload: String,
    pub timeout: Option<Duration>,
    pub detached: bool,
    pub command: Vec<String>,
}

/// Run one invocation and print its JSON result on stdout
pub async fn run(config: &WardenConfig, args: InvokeArgs) -> Result<()> {
    let payload: Value = serde_json::from_str(&args.payload).context("Invalid --payload JSON")?;
    let (path, rest) = args
        .command
        .split_first()
        .context("Missing worker executable")?;

    let client = ForkClient::new(settings::fork_options(config));
    let spawn = SpawnOptions::new().args(rest.iter().cloned());

    if args.detached {
        let worker = client
            .spawn_detached(path, DetachedOptions { spawn, payload })
            .await?;
        println!(
            "{}",
            json!({ "pid": worker.pid, "payloadPath": worker.payload_path })
        );
        return Ok(());
    }

    let mut options = InvokeOptions::new(payload).spawn(spawn);
    if let Some(timeout) = args.timeout {
        options = options.timeout(timeout);
    }

    let result = client.invoke(path, options).await?;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}
