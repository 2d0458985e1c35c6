/// Sync configuration
///
/// One `SyncConfig` is owned by the `Platform` and shared by every session it
/// opens. Durations are stored in milliseconds so the struct round-trips
/// through JSON unchanged; the accessors return `Duration`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use agora_protocol::limits::{clamp_page, HISTORY_PAGE_SIZE, MAX_PINNED_VIEW};
use agora_protocol::ReconcilerConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Messages requested by the initial fetch and every refresh.
    pub history_page_size: usize,
    /// Entries requested by `fetch_pinned`.
    pub pinned_page_size: usize,
    /// Polling fallback interval. 0 disables polling.
    pub poll_interval_ms: u64,
    /// Local typing stops after this long without a keystroke.
    pub typing_quiet_period_ms: u64,
    /// Minimum gap between repeated start signals during one burst.
    pub typing_refresh_window_ms: u64,
    /// A remote typing user expires after this long without a refresh.
    pub remote_typing_timeout_ms: u64,
    /// Delay between push reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// Capacity of each session's change broadcast.
    pub change_channel_capacity: usize,
    /// Capacity of each conversation route in the push hub.
    pub push_channel_capacity: usize,
    pub reconciler: ReconcilerConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_page_size: HISTORY_PAGE_SIZE,
            pinned_page_size: MAX_PINNED_VIEW,
            poll_interval_ms: 3_000,
            typing_quiet_period_ms: 2_000,
            typing_refresh_window_ms: 3_000,
            remote_typing_timeout_ms: 5_000,
            reconnect_delay_ms: 2_000,
            change_channel_capacity: 256,
            push_channel_capacity: 256,
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON document. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if clamp_page(self.history_page_size, HISTORY_PAGE_SIZE) != self.history_page_size {
            return Err(ConfigError::Invalid(format!(
                "history_page_size must be in 1..={}",
                HISTORY_PAGE_SIZE
            )));
        }
        if clamp_page(self.pinned_page_size, MAX_PINNED_VIEW) != self.pinned_page_size {
            return Err(ConfigError::Invalid(format!(
                "pinned_page_size must be in 1..={}",
                MAX_PINNED_VIEW
            )));
        }
        if self.change_channel_capacity == 0 || self.push_channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel capacities must be non-zero".into()));
        }
        if self.typing_quiet_period_ms == 0 || self.remote_typing_timeout_ms == 0 {
            return Err(ConfigError::Invalid("typing timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// `None` when polling is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn typing_quiet_period(&self) -> Duration {
        Duration::from_millis(self.typing_quiet_period_ms)
    }

    pub fn typing_refresh_window(&self) -> Duration {
        Duration::from_millis(self.typing_refresh_window_ms)
    }

    pub fn remote_typing_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_typing_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
