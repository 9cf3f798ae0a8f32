//! Configuration discovery and resolution

use super::types::QueueConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// Explicit overrides from the embedding application
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub strict_dir_sync: Option<bool>,
    pub force_poll: Option<bool>,
    pub max_retries: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub debounce_ms: Option<u64>,
    /// Config file to read instead of `<root>/meta/amq.toml`
    pub config_path: Option<PathBuf>,
}

/// Path of the per-root config file
pub fn config_file_path(root: &Path) -> PathBuf {
    root.join("meta").join("amq.toml")
}

/// Resolve configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Explicit overrides
/// 2. Environment variables (`AMQ_STRICT_DIR_SYNC`, `AMQ_POLL`, `AMQ_MAX_RETRIES`)
/// 3. `<root>/meta/amq.toml`
/// 4. Defaults
///
/// A config file that cannot be parsed is logged and ignored.
pub fn resolve_config(root: &Path, overrides: &ConfigOverrides) -> Result<QueueConfig, ConfigError> {
    let mut config = QueueConfig::default();

    let path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| config_file_path(root));
    if path.exists() {
        match load_config_file(&path) {
            Ok(file_config) => config = file_config,
            Err(e) => warn!("Failed to parse queue config at {path:?}: {e}"),
        }
    }

    apply_env_overrides(&mut config);
    apply_overrides(&mut config, overrides);

    Ok(config)
}

/// Load config from a TOML file
pub fn load_config_file(path: &Path) -> Result<QueueConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: QueueConfig = toml::from_str(&contents)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut QueueConfig) {
    if let Some(strict) = env_flag("AMQ_STRICT_DIR_SYNC") {
        config.delivery.strict_dir_sync = strict;
    }

    if let Some(poll) = env_flag("AMQ_POLL") {
        config.watch.force_poll = poll;
    }

    if let Ok(raw) = std::env::var("AMQ_MAX_RETRIES") {
        match raw.trim().parse::<u32>() {
            Ok(n) => config.dlq.max_retries = n,
            Err(_) => warn!("Ignoring invalid AMQ_MAX_RETRIES={raw:?}"),
        }
    }
}

fn apply_overrides(config: &mut QueueConfig, overrides: &ConfigOverrides) {
    if let Some(strict) = overrides.strict_dir_sync {
        config.delivery.strict_dir_sync = strict;
    }

    if let Some(poll) = overrides.force_poll {
        config.watch.force_poll = poll;
    }

    if let Some(max) = overrides.max_retries {
        config.dlq.max_retries = max;
    }

    if let Some(ms) = overrides.poll_interval_ms {
        config.watch.poll_interval_ms = ms;
    }

    if let Some(ms) = overrides.debounce_ms {
        config.watch.debounce_ms = ms;
    }
}

/// Boolean environment flag: 1/true/yes/on and 0/false/no/off.
fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            warn!("Ignoring invalid {name}={raw:?}");
            None
        }
    }
}
