//! Configuration module for hlwatch
//!
//! Handles loading and validating configuration from YAML files.

use std::path::Path;

use anyhow::{Context, Result};
use hlwatch_core::{ProviderKind, WatchConfig};
use serde::{Deserialize, Serialize};

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Hardware monitoring provider
    #[serde(default)]
    pub provider: ProviderKind,

    /// Log every provider call
    #[serde(default)]
    pub verbose_hlml: bool,

    /// Health watcher timing
    #[serde(default)]
    pub watch: WatchConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.watch.health_check_interval.is_zero() {
            anyhow::bail!("watch.health_check_interval must be > 0");
        }
        if self.watch.wait_timeout.is_zero() {
            anyhow::bail!("watch.wait_timeout must be > 0");
        }
        if self.watch.error_backoff.is_zero() {
            anyhow::bail!("watch.error_backoff must be > 0");
        }
        if self.watch.wait_timeout > self.watch.health_check_interval {
            anyhow::bail!("watch.wait_timeout must not exceed watch.health_check_interval");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        Ok(())
    }
}

fn default_metrics_port() -> u16 {
    9400
}

fn default_true() -> bool {
    true
}
