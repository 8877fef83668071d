//! Validation of merged configuration.

use crate::error::{ConfigError, ConfigResult};
use crate::model::SpoolConfig;

impl SpoolConfig {
    /// Check cross-field and range constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for the first violation found.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.state.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("state", "path", None, "empty"));
        }
        if self.downloads.default_save_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid(
                "downloads",
                "default_save_path",
                None,
                "empty",
            ));
        }

        let downloads = &self.downloads;
        let positive = [
            ("poll_interval_ms", downloads.poll_interval_ms),
            ("paused_poll_interval_ms", downloads.paused_poll_interval_ms),
            ("metadata_timeout_secs", downloads.metadata_timeout_secs),
            ("progress_throttle_secs", downloads.progress_throttle_secs),
            ("render_timeout_secs", downloads.render_timeout_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(
                    "downloads",
                    field,
                    Some(value.to_string()),
                    "must_be_positive",
                ));
            }
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging", "level", None, "empty"));
        }
        Ok(())
    }
}
