use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RhiError;

/// Top-level pipeline configuration, loaded from rhiq.toml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub interrupt: InterruptConfig,
    #[serde(default)]
    pub device_lost: DeviceLostConfig,
    #[serde(default)]
    pub recovery: RecoveryOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// Maximum number of same-queue payloads coalesced into one submit
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// How long `stop` waits for the queue to drain
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptConfig {
    /// How long `stop` waits for pending completions to drain
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Length of one bounded fence wait before the stop flag is rechecked
    #[serde(default = "default_wait_slice_ms")]
    pub wait_slice_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLostConfig {
    /// Whether the per-frame tick should poll for device loss
    #[serde(default)]
    pub auto_polling: bool,
    /// Minimum interval between two automatic polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Device recovery policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOptions {
    /// Try to recreate the device after a loss
    #[serde(default = "default_true")]
    pub auto_recreate: bool,
    /// Prefer the adapter the lost device ran on
    #[serde(default = "default_true")]
    pub prefer_same_adapter: bool,
    /// Replay resource-recreate callbacks against the new device
    #[serde(default = "default_true")]
    pub recreate_resources: bool,
    /// Per-attempt recreation timeout
    #[serde(default = "default_stop_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts allowed before recovery gives up for good
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout_ms(),
            wait_slice_ms: default_wait_slice_ms(),
        }
    }
}

impl Default for DeviceLostConfig {
    fn default() -> Self {
        Self {
            auto_polling: false,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            auto_recreate: true,
            prefer_same_adapter: true,
            recreate_resources: true,
            timeout_ms: default_stop_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl SubmissionConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl InterruptConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms.max(1))
    }
}

impl DeviceLostConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RecoveryOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, RhiError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, RhiError> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| RhiError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }

    pub fn to_toml(&self) -> Result<String, RhiError> {
        toml::to_string_pretty(self).map_err(|e| RhiError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), RhiError> {
        if self.submission.max_batch_size == 0 {
            return Err(RhiError::Config(
                "submission.max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.interrupt.wait_slice_ms == 0 {
            return Err(RhiError::Config(
                "interrupt.wait_slice_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. `RHIQ_CONFIG` environment variable
/// 2. System-wide config: `/etc/rhiq/rhiq.toml` (Unix only)
/// 3. Local fallback: `./rhiq.toml`
pub fn default_config_path() -> String {
    if let Ok(path) = std::env::var("RHIQ_CONFIG") {
        return path;
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/rhiq/rhiq.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "rhiq.toml".to_string()
}

fn default_max_batch_size() -> usize {
    64
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_wait_slice_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}
