//! Configuration types

use crate::io::atomic::DirSync;
use crate::watch::MIN_POLL_INTERVAL;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete queue configuration, as stored in `<root>/meta/amq.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
}

impl QueueConfig {
    pub fn dir_sync(&self) -> DirSync {
        if self.delivery.strict_dir_sync {
            DirSync::Strict
        } else {
            DirSync::Lenient
        }
    }
}

/// Delivery durability settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Propagate directory fsync failures the filesystem reports as
    /// unsupported instead of continuing without them
    #[serde(default)]
    pub strict_dir_sync: bool,
}

/// Watcher timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Rescan interval of the polling backend
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pause after a create/rename event before rescanning
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Coalescing window for drain mode
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Skip the event backend entirely (network filesystems)
    #[serde(default)]
    pub force_poll: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            debounce_ms: default_debounce_ms(),
            force_poll: false,
        }
    }
}

impl WatchConfig {
    /// Never shorter than [`MIN_POLL_INTERVAL`]; `0` would spin.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).max(MIN_POLL_INTERVAL)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Retries allowed before `force` is required
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_settle_delay_ms() -> u64 {
    10
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    crate::schema::MAX_RETRIES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert!(!config.delivery.strict_dir_sync);
        assert_eq!(config.dir_sync(), DirSync::Lenient);
        assert_eq!(config.watch.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.watch.settle_delay(), Duration::from_millis(10));
        assert_eq!(config.watch.debounce(), Duration::from_millis(250));
        assert!(!config.watch.force_poll);
        assert_eq!(config.dlq.max_retries, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: QueueConfig = toml::from_str(
            r#"
[delivery]
strict_dir_sync = true

[watch]
debounce_ms = 50
"#,
        )
        .unwrap();
        assert_eq!(config.dir_sync(), DirSync::Strict);
        assert_eq!(config.watch.debounce_ms, 50);
        assert_eq!(config.watch.poll_interval_ms, 500);
        assert_eq!(config.dlq.max_retries, 3);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config: QueueConfig = toml::from_str("[watch]\npoll_interval_ms = 0\n").unwrap();
        assert_eq!(config.watch.poll_interval_ms, 0);
        assert_eq!(config.watch.poll_interval(), MIN_POLL_INTERVAL);
    }
}
