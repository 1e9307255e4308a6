//! Sync configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Channel names and time windows shared by every context of one app.
///
/// The throttle and dedup windows are independent knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Broadcast-bus channel name.
    pub channel_name: String,
    /// Key used by the storage-event side channel.
    pub fallback_key: String,
    /// `source` marker of the cross-frame envelope.
    pub frame_source: String,
    /// Minimum spacing between two outbound messages of one store.
    pub throttle_ms: u64,
    /// How long a processed dedup key is remembered.
    pub dedup_window_ms: u64,
    /// Upper bound on remembered dedup keys per store.
    pub dedup_capacity: usize,
    /// Delay before the side-channel key is deleted again.
    pub fallback_cleanup_ms: u64,
    /// Allow posting to frames of another origin.
    pub allow_cross_origin_frames: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            channel_name: "music-player-sync".to_string(),
            fallback_key: "music-player-sync-message".to_string(),
            frame_source: "music-player-sync".to_string(),
            throttle_ms: 100,
            dedup_window_ms: 1000,
            dedup_capacity: 1024,
            fallback_cleanup_ms: 100,
            allow_cross_origin_frames: false,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON config. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns error if the JSON is malformed or a value is out of range.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns error naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_name.is_empty() {
            return Err(ConfigError::Invalid("channelName must not be empty".into()));
        }
        if self.fallback_key.is_empty() {
            return Err(ConfigError::Invalid("fallbackKey must not be empty".into()));
        }
        if self.frame_source.is_empty() {
            return Err(ConfigError::Invalid("frameSource must not be empty".into()));
        }
        if self.throttle_ms == 0 {
            return Err(ConfigError::Invalid("throttleMs must be positive".into()));
        }
        if self.dedup_window_ms == 0 {
            return Err(ConfigError::Invalid("dedupWindowMs must be positive".into()));
        }
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Invalid("dedupCapacity must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub const fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    #[must_use]
    pub const fn fallback_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_cleanup_ms)
    }
}
