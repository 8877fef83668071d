//! Typed configuration document.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Full configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpoolConfig {
    /// Persisted state settings.
    pub state: StateConfig,
    /// Queue and supervisor tunables.
    pub downloads: DownloadPolicy,
    /// Logging output.
    pub logging: LoggingSettings,
}

/// Where the queue snapshot is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    /// State file path.
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(defaults::STATE_PATH),
        }
    }
}

/// Timing knobs for dispatch, supervision and progress rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadPolicy {
    /// Directory used when a request does not name one.
    pub default_save_path: PathBuf,
    /// Status poll interval while running.
    pub poll_interval_ms: u64,
    /// Status poll interval while paused.
    pub paused_poll_interval_ms: u64,
    /// Metadata fetch timeout.
    pub metadata_timeout_secs: u64,
    /// Delay before retrying a lone timed-out job.
    pub requeue_cooldown_secs: u64,
    /// Minimum spacing between progress renders.
    pub progress_throttle_secs: u64,
    /// Upper bound on one render call.
    pub render_timeout_secs: u64,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            default_save_path: PathBuf::from(defaults::SAVE_PATH),
            poll_interval_ms: defaults::POLL_INTERVAL_MS,
            paused_poll_interval_ms: defaults::PAUSED_POLL_INTERVAL_MS,
            metadata_timeout_secs: defaults::METADATA_TIMEOUT_SECS,
            requeue_cooldown_secs: defaults::REQUEUE_COOLDOWN_SECS,
            progress_throttle_secs: defaults::PROGRESS_THROTTLE_SECS,
            render_timeout_secs: defaults::RENDER_TIMEOUT_SECS,
        }
    }
}

impl DownloadPolicy {
    /// Poll interval while running.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Poll interval while paused.
    #[must_use]
    pub const fn paused_poll_interval(&self) -> Duration {
        Duration::from_millis(self.paused_poll_interval_ms)
    }

    /// Metadata fetch timeout.
    #[must_use]
    pub const fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    /// Cooldown before retrying a lone timed-out job.
    #[must_use]
    pub const fn requeue_cooldown(&self) -> Duration {
        Duration::from_secs(self.requeue_cooldown_secs)
    }

    /// Minimum spacing between progress renders.
    #[must_use]
    pub const fn progress_throttle(&self) -> Duration {
        Duration::from_secs(self.progress_throttle_secs)
    }

    /// Upper bound on one render call.
    #[must_use]
    pub const fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutput {
    /// Structured JSON lines.
    Json,
    /// Human-readable output.
    Pretty,
}

impl LogOutput {
    /// Parse the textual form used by `SPOOL_LOG_FORMAT`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// Level used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format; inferred from the build profile when unset.
    pub format: Option<LogOutput>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            format: None,
        }
    }
}
