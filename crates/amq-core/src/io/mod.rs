//! Filesystem primitives for the queue
//!
//! - **Durable writes**: temp file, fsync, rename, directory fsync
//! - **Maildir delivery**: `tmp` -> `new` -> `cur` handoff by rename
//! - **Dead letter queue**: quarantine, inspection and bounded retry
//! - **Advisory locks**: exclusive `flock` on a sibling lock file

pub mod atomic;
pub mod dlq;
pub mod error;
pub mod layout;
pub mod lock;
pub mod maildir;

pub use atomic::{DirSync, deliver_via, deliver_via_exclusive, move_durable, sync_dir, write_file_atomic};
pub use dlq::{DlqEntry, DlqFilter, PurgeFilter, PurgeReport, RetryAllReport, RetryOutcome};
pub use error::QueueError;
pub use layout::{Folder, Layout, validate_filename, validate_handle, validate_topic};
pub use lock::{FileLock, acquire_lock, try_acquire_lock, with_lock};
pub use maildir::DeliveryReport;
