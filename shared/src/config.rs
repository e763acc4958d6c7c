use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Engine tuning knobs. All durations are milliseconds so the struct can be
/// shipped from the native shell as JSON.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub command_queue_capacity: usize,
    pub location_timeout_ms: u64,
    pub recorder_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub min_safety_timer_ms: u64,
    pub max_safety_timer_ms: u64,
    /// Snapshot file for the history; `None` keeps history in memory only.
    pub history_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_queue_capacity: 64,
            location_timeout_ms: 5_000,
            recorder_timeout_ms: 3_000,
            store_timeout_ms: 2_000,
            min_safety_timer_ms: 1,
            max_safety_timer_ms: 24 * 60 * 60 * 1000,
            history_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_queue_capacity == 0 {
            return Err(ConfigError::Invalid("command_queue_capacity must be > 0".into()));
        }
        if self.location_timeout_ms == 0 {
            return Err(ConfigError::Invalid("location_timeout_ms must be > 0".into()));
        }
        if self.recorder_timeout_ms == 0 {
            return Err(ConfigError::Invalid("recorder_timeout_ms must be > 0".into()));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Invalid("store_timeout_ms must be > 0".into()));
        }
        if self.min_safety_timer_ms == 0 {
            return Err(ConfigError::Invalid("min_safety_timer_ms must be > 0".into()));
        }
        if self.max_safety_timer_ms < self.min_safety_timer_ms {
            return Err(ConfigError::Invalid(
                "max_safety_timer_ms must be >= min_safety_timer_ms".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn location_timeout(&self) -> Duration {
        Duration::from_millis(self.location_timeout_ms)
    }

    #[must_use]
    pub fn recorder_timeout(&self) -> Duration {
        Duration::from_millis(self.recorder_timeout_ms)
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
