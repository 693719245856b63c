//! Engine configuration
//!
//! Loaded from a YAML file named by `RECONCILE_ENGINE_CONFIG` when set, with
//! a few environment overrides on top. Every field has a default, so an empty
//! file (or no file) is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::workqueue::rate_limiter::{ExponentialBackoff, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "RECONCILE_ENGINE_CONFIG";

/// Environment override for `max_concurrent_reconciles`
pub const WORKERS_ENV: &str = "RECONCILE_ENGINE_WORKERS";

/// Environment override for `metrics_port`
pub const METRICS_PORT_ENV: &str = "RECONCILE_ENGINE_METRICS_PORT";

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Backoff applied to failing requests
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound of the delay
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
        }
    }
}

impl BackoffConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Rate limiter implementing this backoff
    pub fn rate_limiter<K>(&self) -> ExponentialBackoff<K> {
        ExponentialBackoff::new(self.base_delay(), self.max_delay())
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers per controller
    pub max_concurrent_reconciles: usize,
    pub backoff: BackoffConfig,
    /// Port of the metrics and health endpoint
    pub metrics_port: u16,
    pub log_format: LogFormat,
    /// Namespace to watch; all namespaces when unset
    pub namespace: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 1,
            backoff: BackoffConfig::default(),
            metrics_port: 8080,
            log_format: LogFormat::default(),
            namespace: None,
        }
    }
}

impl EngineConfig {
    /// Load from the file named by `RECONCILE_ENGINE_CONFIG` and the process environment
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file; does not apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Apply overrides from `lookup`, which maps variable names to values
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = lookup(WORKERS_ENV) {
            self.max_concurrent_reconciles = workers.trim().parse().map_err(|e| {
                Error::config(format!("{} must be a positive integer: {}", WORKERS_ENV, e))
            })?;
        }
        if let Some(port) = lookup(METRICS_PORT_ENV) {
            self.metrics_port = port.trim().parse().map_err(|e| {
                Error::config(format!("{} must be a port number: {}", METRICS_PORT_ENV, e))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::config("max_concurrent_reconciles must be at least 1"));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(Error::config(format!(
                "backoff base delay ({}ms) exceeds max delay ({}ms)",
                self.backoff.base_delay_ms, self.backoff.max_delay_ms
            )));
        }
        Ok(())
    }
}
