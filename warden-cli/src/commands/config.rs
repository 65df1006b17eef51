use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;
use warden_config::{ConfigLoader, WardenConfig};

use crate::cli::ConfigCommands;

pub fn run(config: &WardenConfig, command: &ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config_file } => validate(config_file),
        ConfigCommands::Sample { output, force } => sample(output.as_deref(), *force),
        ConfigCommands::Show { format } => show(config, format),
    }
}

fn validate(config_file: &Path) -> Result<()> {
    if !config_file.exists() {
        return Err(anyhow!("Configuration file not found: {:?}", config_file));
    }
    let config = ConfigLoader::new()
        .from_file(config_file)
        .with_context(|| format!("Configuration validation failed for {:?}", config_file))?;

    println!(
        "Configuration is valid ({} worker categories)",
        config.workers.len()
    );
    Ok(())
}

fn sample(output: Option<&Path>, force: bool) -> Result<()> {
    let content = WardenConfig::generate_sample();
    let Some(output) = output else {
        print!("{}", content);
        return Ok(());
    };

    if output.exists() && !force {
        return Err(anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }
    fs::write(output, content).context("Failed to write configuration file")?;
    info!(path = %output.display(), "Sample configuration written");
    Ok(())
}

fn show(config: &WardenConfig, format: &str) -> Result<()> {
    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            print!("{}", serde_yaml::to_string(config).context("Failed to serialize to YAML")?);
        }
        "json" => {
            println!(
                "{}",
                serde_json::to_string_pretty(config).context("Failed to serialize to JSON")?
            );
        }
        _ => {
            return Err(anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }
    Ok(())
}
