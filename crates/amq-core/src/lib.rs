//! Core of agent-message-queue: broker-less messaging between agent sessions
//! on a shared filesystem.
//!
//! Each agent owns a maildir-style mailbox under `<root>/agents/<handle>/`.
//! Delivery, consumption and dead-lettering are built from atomic renames and
//! fsync alone, so any number of independent processes can share a root
//! without a coordinator.
//!
//! Entry points:
//! - [`MailQueue`]: delivery, promotion, drain and the dead letter queue
//! - [`watch::Watcher`]: blocking waits for new mail with deadline and cancel
//! - [`io::with_lock`]: advisory locking for other shared state

pub mod cleanup;
pub mod config;
pub mod drain;
pub mod io;
pub mod logging;
pub mod queue;
pub mod schema;
pub mod validate;
pub mod watch;

pub use drain::{DrainOptions, DrainedItem, MonitorOutcome};
pub use io::{DeliveryReport, Folder, QueueError};
pub use queue::MailQueue;
pub use schema::{DlqEnvelope, FailureReason, Header, Message};
pub use watch::{CancelToken, WaitOutcome, Watcher};
