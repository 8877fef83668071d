//! Layered configuration loading.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ConfigResult};
use crate::model::{LogOutput, SpoolConfig};

/// Environment variable naming an optional JSON configuration document.
pub const CONFIG_PATH_ENV: &str = "SPOOL_CONFIG";

/// Load configuration from the process environment.
///
/// # Errors
///
/// Returns an error when the configuration document cannot be read or parsed,
/// when an override does not parse, or when the merged result fails validation.
pub fn load_from_env() -> ConfigResult<SpoolConfig> {
    load_with(|key| std::env::var(key).ok())
}

/// Load configuration using `lookup` in place of the process environment.
///
/// # Errors
///
/// See [`load_from_env`].
pub fn load_with<F>(lookup: F) -> ConfigResult<SpoolConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match lookup(CONFIG_PATH_ENV) {
        Some(path) if !path.trim().is_empty() => load_file(Path::new(path.trim()))?,
        _ => SpoolConfig::default(),
    };
    apply_overrides(&mut config, &lookup)?;
    config.validate()?;
    Ok(config)
}

/// Parse a JSON configuration document; missing fields take their defaults.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when the file cannot be read and
/// [`ConfigError::Parse`] when it does not match the schema.
pub fn load_file(path: &Path) -> ConfigResult<SpoolConfig> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        operation: "config.read",
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_overrides<F>(config: &mut SpoolConfig, lookup: &F) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("SPOOL_STATE_FILE") {
        config.state.path = PathBuf::from(value);
    }
    if let Some(value) = lookup("SPOOL_SAVE_PATH") {
        config.downloads.default_save_path = PathBuf::from(value);
    }

    let downloads = &mut config.downloads;
    let numeric = [
        (
            "SPOOL_POLL_INTERVAL_MS",
            "poll_interval_ms",
            &mut downloads.poll_interval_ms,
        ),
        (
            "SPOOL_PAUSED_POLL_INTERVAL_MS",
            "paused_poll_interval_ms",
            &mut downloads.paused_poll_interval_ms,
        ),
        (
            "SPOOL_METADATA_TIMEOUT_SECS",
            "metadata_timeout_secs",
            &mut downloads.metadata_timeout_secs,
        ),
        (
            "SPOOL_REQUEUE_COOLDOWN_SECS",
            "requeue_cooldown_secs",
            &mut downloads.requeue_cooldown_secs,
        ),
        (
            "SPOOL_PROGRESS_THROTTLE_SECS",
            "progress_throttle_secs",
            &mut downloads.progress_throttle_secs,
        ),
        (
            "SPOOL_RENDER_TIMEOUT_SECS",
            "render_timeout_secs",
            &mut downloads.render_timeout_secs,
        ),
    ];
    for (key, field, slot) in numeric {
        if let Some(value) = lookup(key) {
            *slot = value.trim().parse().map_err(|_| {
                ConfigError::invalid("downloads", field, Some(value.clone()), "not_an_integer")
            })?;
        }
    }

    if let Some(value) = lookup("SPOOL_LOG_LEVEL") {
        config.logging.level = value;
    }
    if let Some(value) = lookup("SPOOL_LOG_FORMAT") {
        let format = LogOutput::parse(&value).ok_or_else(|| {
            ConfigError::invalid("logging", "format", Some(value.clone()), "unknown_format")
        })?;
        config.logging.format = Some(format);
    }
    Ok(())
}
