//! Error types for mailbox, DLQ, lock and watch operations

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// File I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Requested message or DLQ entry does not exist
    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    /// Rename crossed a filesystem boundary; no copy fallback is attempted
    #[error("rename {from} -> {to}: different filesystems: {source}")]
    CrossDevice {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    /// DLQ entry reached the retry bound and `force` was not set
    #[error("max retries ({max_retries}) exceeded; use force to override")]
    RetryExhausted { max_retries: u32 },

    /// Redelivery would overwrite a message already waiting in inbox/new
    #[error("original file already exists in inbox/new: {path}")]
    AlreadyInInbox { path: PathBuf },

    /// Failed to parse or serialize JSON
    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// DLQ file framing is malformed
    #[error("malformed DLQ entry {path}: {source}")]
    Envelope {
        path: PathBuf,
        source: crate::schema::ParseError,
    },

    /// Message file could not be decoded
    #[error("unreadable message {path}: {source}")]
    Parse {
        path: PathBuf,
        source: crate::schema::ParseError,
    },

    /// Agent handle, topic or filename rejected
    #[error("invalid {kind} {value:?}: {reason}")]
    InvalidName {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    /// Fan-out delivery called with an empty recipient list
    #[error("no recipients provided")]
    NoRecipients,

    /// The change-notification stream ended while waiting
    #[error("watcher closed")]
    WatchClosed,

    /// Event backend failure
    #[error("watch error on {path}: {source}")]
    Notify {
        path: PathBuf,
        source: notify::Error,
    },

    /// Failed to acquire file lock after multiple retries
    #[error("Failed to acquire lock on {path} after {retries} retries")]
    LockTimeout { path: PathBuf, retries: u32 },

    /// A primary failure whose temp-file cleanup also failed
    #[error("{source} (cleanup: {cleanup})")]
    Cleanup {
        source: Box<QueueError>,
        cleanup: std::io::Error,
    },
}

impl QueueError {
    /// Wrap an `io::Error` with the path it happened on.
    ///
    /// `NotFound` from the OS is mapped to [`QueueError::NotFound`] so callers
    /// can render missing entries without inspecting error kinds.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            return QueueError::NotFound { path };
        }
        QueueError::Io { path, source }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            QueueError::NotFound { .. } => true,
            QueueError::Cleanup { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Closure adapter for `map_err` that attaches `path`.
pub(crate) fn at(path: &Path) -> impl FnOnce(std::io::Error) -> QueueError + '_ {
    move |e| QueueError::io(path, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_io_maps_not_found() {
        let err = QueueError::io("/tmp/x", Error::from(ErrorKind::NotFound));
        assert!(err.is_not_found());
        assert!(matches!(err, QueueError::NotFound { .. }));
    }

    #[test]
    fn test_io_keeps_other_kinds() {
        let err = QueueError::io("/tmp/x", Error::from(ErrorKind::PermissionDenied));
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("/tmp/x"));
    }

    #[test]
    fn test_cleanup_reports_both() {
        let primary = QueueError::io("/tmp/a", Error::from(ErrorKind::PermissionDenied));
        let err = QueueError::Cleanup {
            source: Box::new(primary),
            cleanup: Error::other("busy"),
        };
        let text = err.to_string();
        assert!(text.contains("/tmp/a"));
        assert!(text.contains("cleanup: busy"));
    }

    #[test]
    fn test_retry_exhausted_message() {
        let err = QueueError::RetryExhausted { max_retries: 3 };
        assert_eq!(err.to_string(), "max retries (3) exceeded; use force to override");
    }
}
