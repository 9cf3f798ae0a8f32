//! Configuration resolution
//!
//! Resolves configuration from multiple sources with priority:
//! 1. Explicit overrides (passed as parameters)
//! 2. Environment variables
//! 3. Root-local config (`<root>/meta/amq.toml`)
//! 4. Defaults

mod discovery;
mod types;

pub use discovery::{ConfigError, ConfigOverrides, config_file_path, load_config_file, resolve_config};
pub use types::{DeliveryConfig, DlqConfig, QueueConfig, WatchConfig};
