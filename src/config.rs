// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::env::BrokerEndpoint;

const CONFIG_FILE_NAME: &str = "rmq-channels.json";
const MIN_POLL_INTERVAL_MS: u64 = 1;

// Configuration structures
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RabbitConfig {
    #[serde(default)]
    pub connection: BrokerEndpoint,
    #[serde(default)]
    pub manager: ManagerSettings,
}

/// Timing knobs shared by every worker of a manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Pause between a failed attempt and the next reconnect.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Upper bound on how long `shutdown` waits for workers to finish.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// How long a sender waits on an empty queue before re-checking for shutdown.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

// Default values
fn default_retry_backoff() -> u64 { 10_000 }
fn default_shutdown_timeout() -> u64 { 5_000 }
fn default_poll_interval() -> u64 { 1_000 }

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl ManagerSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Never zero, so an idle sender always yields between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = (interval.as_millis() as u64).max(MIN_POLL_INTERVAL_MS);
        self
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Option<PathBuf> {
    // Check various locations
    let local = Path::new(CONFIG_FILE_NAME).to_path_buf();
    let nested = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [("Current directory", local), ("Config directory", nested)];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.clone());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn load_config_from(path: &Path) -> Result<RabbitConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    // Parse and validate the config structure
    let config: RabbitConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or mistyped fields")?;

    if config.connection.host.is_empty() {
        return Err(anyhow!("Configuration error: connection.host cannot be empty"));
    }
    if config.manager.poll_interval_ms == 0 {
        return Err(anyhow!("Configuration error: manager.poll_interval_ms must be positive"));
    }

    Ok(config)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&RabbitConfig::default())
        .context("Failed to serialize default configuration")?;

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
