// Shared configuration types

//! Engine configuration structures
//!
//! Deserialized from the `wirewan.toml` file by [`crate::config::load_config`].
//! Every section and field has a default so an empty file is a valid config.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// `[general]`
    #[serde(default)]
    pub general: GeneralConfig,
    /// `[deploy]`
    #[serde(default)]
    pub deploy: DeployConfig,
    /// `[defaults]`
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

/// General options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// env_logger filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory holding the job journal
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Deployment executor tuning
#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    /// Devices deployed to at once by `deploy-all`
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_deployments: usize,
    /// Extra attempts for connectivity failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay, doubled per attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Per-call timeout against a device API
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Present the diff and wait for approval before applying
    #[serde(default = "default_require_approval")]
    pub require_approval: bool,
    /// Age after which an unfinished job no longer holds its device
    #[serde(default = "default_stale_job_secs")]
    pub stale_job_secs: u64,
}

impl DeployConfig {
    /// Per-call timeout as a duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// First retry delay as a duration
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Stale job threshold as a duration
    pub fn stale_job_after(&self) -> Duration {
        Duration::from_secs(self.stale_job_secs)
    }
}

/// Fallbacks used when a peer record leaves a value unset
#[derive(Debug, Deserialize, Clone)]
pub struct DefaultsConfig {
    /// Interface name used instead of the one derived from the WAN name
    #[serde(default)]
    pub interface_name: Option<String>,
    /// WireGuard listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive: u16,
    /// Management API port when the peer does not name one
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deployments: default_max_concurrent(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            call_timeout_secs: default_call_timeout(),
            require_approval: default_require_approval(),
            stale_job_secs: default_stale_job_secs(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            interface_name: None,
            listen_port: default_listen_port(),
            persistent_keepalive: default_keepalive(),
            api_port: default_api_port(),
        }
    }
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/wirewan")
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_call_timeout() -> u64 {
    30
}

fn default_require_approval() -> bool {
    true
}

fn default_stale_job_secs() -> u64 {
    3600
}

fn default_listen_port() -> u16 {
    crate::model::DEFAULT_LISTEN_PORT
}

fn default_keepalive() -> u16 {
    crate::model::DEFAULT_KEEPALIVE
}

fn default_api_port() -> u16 {
    443
}
