//! Handle to one queue root
//!
//! Every operation takes its paths from a [`MailQueue`] value rather than from
//! process-wide state, so several roots can be driven from one process.

use crate::config::{ConfigError, ConfigOverrides, QueueConfig, resolve_config};
use crate::io::atomic::DirSync;
use crate::io::layout::Layout;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct MailQueue {
    layout: Layout,
    config: QueueConfig,
}

impl MailQueue {
    /// Queue at `root` with default configuration.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, QueueConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: QueueConfig) -> Self {
        Self {
            layout: Layout::new(root),
            config,
        }
    }

    /// Queue at `root` with configuration resolved from overrides, the
    /// environment and `<root>/meta/amq.toml`.
    pub fn open(root: impl Into<PathBuf>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let root = root.into();
        let config = resolve_config(&root, overrides)?;
        Ok(Self::with_config(root, config))
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub(crate) fn dir_sync(&self) -> DirSync {
        self.config.dir_sync()
    }

    pub fn max_retries(&self) -> u32 {
        self.config.dlq.max_retries
    }
}
