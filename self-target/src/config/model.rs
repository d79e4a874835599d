// src/config/model.rs

use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

use crate::device::Access;

/// Top-level runtime config. Every table is optional in TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub engine:  EngineConfig,
    pub target:  TargetConfig,
    pub request: RequestConfig,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]            pub enable: bool,
    #[serde(default)]            pub file:   Option<String>,
    #[serde(default = "default_level")] pub level: String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// Mirror of the `[engine]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Threads servicing the request queue; at least one.
    pub worker_threads: usize,
    /// Requests that may wait in the queue before sends are refused.
    pub queue_depth:    usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { worker_threads: 2, queue_depth: 64 }
    }
}

/// Mirror of the `[target]` table: share access requested when the loopback
/// target opens the device stack.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub share_read:  bool,
    pub share_write: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self { share_read: true, share_write: true }
    }
}

impl TargetConfig {
    pub fn share_access(&self) -> Access {
        Access { read: self.share_read, write: self.share_write }
    }
}

/// Mirror of the `[request]` table
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// e.g. `"5s"`, `"250ms"`; `"0s"` means no timeout.
    #[serde(deserialize_with = "de_duration")]
    pub default_timeout: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self { default_timeout: Duration::from_secs(5) }
    }
}

impl RequestConfig {
    /// Timeout in the unit requests carry. Saturates at `u32::MAX`.
    pub fn default_timeout_ms(&self) -> u32 {
        u32::try_from(self.default_timeout.as_millis()).unwrap_or(u32::MAX)
    }
}

fn de_duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Config {
    /// Reject values that would leave the engine unable to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.worker_threads",
                reason: "must be at least 1".into(),
            });
        }
        if self.engine.queue_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.queue_depth",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}
