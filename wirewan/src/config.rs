// Configuration file parser

//! Configuration and model file loading
//!
//! Loads the engine's TOML configuration and the overlay model file, and
//! validates both before anything touches a device.

use crate::model::OverlayModel;
use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
pub fn validate_config(config: &Config) -> Result<()> {
    if config.general.log_level.is_empty() {
        anyhow::bail!("log_level cannot be empty");
    }

    if config.deploy.max_concurrent_deployments == 0 {
        anyhow::bail!("max_concurrent_deployments must be > 0");
    }

    if config.deploy.call_timeout_secs == 0 {
        anyhow::bail!("call_timeout_secs must be > 0");
    }

    if config.deploy.stale_job_secs == 0 {
        anyhow::bail!("stale_job_secs must be > 0");
    }

    // Backoff doubles per attempt
    if config.deploy.max_retries > 10 {
        anyhow::bail!(
            "max_retries must be <= 10, got {}",
            config.deploy.max_retries
        );
    }

    if config.defaults.listen_port == 0 {
        anyhow::bail!("defaults.listen_port must be > 0");
    }

    if let Some(name) = &config.defaults.interface_name {
        if name.is_empty() {
            anyhow::bail!("defaults.interface_name cannot be empty when set");
        }
    }

    Ok(())
}

/// Load and validate an overlay model file
pub fn load_model<P: AsRef<Path>>(path: P) -> Result<OverlayModel> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read model file {}", path.display()))?;

    let model: OverlayModel =
        toml::from_str(&contents).context("Failed to parse model file")?;

    model
        .validate()
        .with_context(|| format!("Invalid model in {}", path.display()))?;
    Ok(model)
}
