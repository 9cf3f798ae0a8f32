//! Consuming an inbox
//!
//! A drain pass takes every entry waiting in `inbox/new`, quarantines the
//! ones that cannot be consumed, promotes the rest to `inbox/cur` and writes
//! read receipts when the sender asked for one. Per-entry failures are logged
//! and recorded on the item; they never stop the pass.

use crate::io::atomic::write_file_atomic;
use crate::io::error::QueueError;
use crate::io::layout::validate_handle;
use crate::queue::MailQueue;
use crate::schema::Ack;
use crate::validate::{BasicValidator, HeaderValidator, safe_id};
use crate::watch::{CancelToken, InboxEntry, WaitOutcome, scan_inbox};
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainOptions {
    pub include_body: bool,
    /// Drain at most this many entries, oldest first; `Some(0)` means no limit
    pub limit: Option<usize>,
    /// Write read receipts for messages with `ack_required`
    pub ack: bool,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            include_body: false,
            limit: None,
            ack: true,
        }
    }
}

/// What happened to one entry during a drain pass
#[derive(Debug, Clone, PartialEq)]
pub struct DrainedItem {
    pub entry: InboxEntry,
    pub moved_to_cur: bool,
    pub moved_to_dlq: bool,
    pub acked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    Messages(Vec<DrainedItem>),
    /// Woken up, but a sibling consumer drained everything first
    Empty,
    TimedOut,
    Cancelled,
}

impl MailQueue {
    /// Drain `agent`'s inbox, validating against the root's known agents.
    pub fn drain(&self, agent: &str, options: &DrainOptions) -> Result<Vec<DrainedItem>, QueueError> {
        let validator = BasicValidator::from_root(self.root());
        self.drain_with(agent, &validator, options)
    }

    pub fn drain_with(
        &self,
        agent: &str,
        validator: &dyn HeaderValidator,
        options: &DrainOptions,
    ) -> Result<Vec<DrainedItem>, QueueError> {
        validate_handle(agent)?;
        let mut entries = scan_inbox(&self.layout().inbox_new(agent), validator, options.include_body)?;
        if let Some(limit) = options.limit.filter(|&n| n > 0) {
            entries.truncate(limit);
        }
        Ok(self.consume(agent, entries, options.ack))
    }

    /// Settle entries already collected by a scan or a watcher batch.
    pub fn consume(&self, agent: &str, entries: Vec<InboxEntry>, ack: bool) -> Vec<DrainedItem> {
        entries
            .into_iter()
            .map(|entry| self.consume_one(agent, entry, ack))
            .collect()
    }

    fn consume_one(&self, agent: &str, entry: InboxEntry, ack: bool) -> DrainedItem {
        let mut item = DrainedItem {
            entry,
            moved_to_cur: false,
            moved_to_dlq: false,
            acked: false,
        };

        if let Some(failure) = &item.entry.failure {
            match self.quarantine(
                agent,
                &item.entry.filename,
                &item.entry.id,
                failure.reason.clone(),
                &failure.detail,
            ) {
                Ok(_) => item.moved_to_dlq = true,
                Err(e) if e.is_not_found() => {
                    debug!(filename = %item.entry.filename, "entry taken by another consumer before quarantine");
                }
                Err(e) => warn!(filename = %item.entry.filename, error = %e, "failed to move entry to DLQ"),
            }
            return item;
        }

        match self.promote(agent, &item.entry.filename) {
            Ok(_) => item.moved_to_cur = true,
            Err(e) if e.is_not_found() => {
                debug!(filename = %item.entry.filename, "entry taken by another consumer");
            }
            Err(e) => warn!(filename = %item.entry.filename, error = %e, "failed to move entry to cur"),
        }

        if ack && item.moved_to_cur && item.entry.ack_required() {
            match self.ack(agent, &item.entry) {
                Ok(()) => item.acked = true,
                Err(e) => warn!(id = %item.entry.id, error = %e, "failed to ack"),
            }
        }
        item
    }

    /// Record a read receipt for `entry` on both sides.
    ///
    /// The receiver's `acks/sent` copy is written durably and reused if it
    /// already exists, so repeated drains keep the first receipt time. The
    /// sender's `acks/received` copy is best-effort.
    fn ack(&self, me: &str, entry: &InboxEntry) -> Result<(), QueueError> {
        let Some(header) = &entry.header else {
            return Ok(());
        };
        validate_handle(&header.from)?;
        let msg_id = safe_id(&entry.id).ok_or_else(|| QueueError::InvalidName {
            kind: "message id",
            value: entry.id.clone(),
            reason: "not usable as a filename",
        })?;

        let layout = self.layout();
        let filename = format!("{msg_id}.json");
        let sent_dir = layout.acks_sent(me);
        let sent_path = sent_dir.join(&filename);

        let existing = match std::fs::read(&sent_path) {
            Ok(data) => match serde_json::from_slice::<Ack>(&data) {
                Ok(ack) => Some(ack),
                Err(e) => {
                    warn!(path = %sent_path.display(), error = %e, "corrupt ack file, rewriting");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(QueueError::io(&sent_path, e)),
        };
        let needs_write = existing.is_none();
        let receipt = existing
            .unwrap_or_else(|| Ack::new(&entry.id, &header.thread, me, &header.from, Utc::now()));
        let data = receipt.to_bytes().map_err(|source| QueueError::Json {
            path: sent_path.clone(),
            source,
        })?;

        if needs_write {
            write_file_atomic(&sent_dir, &filename, &data, self.dir_sync())?;
        }

        let received_dir = layout.acks_received(&header.from);
        match std::fs::metadata(received_dir.join(&filename)) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Err(e) = write_file_atomic(&received_dir, &filename, &data, self.dir_sync()) {
                    warn!(sender = %header.from, error = %e, "unable to write sender ack");
                }
            }
            Err(e) => return Err(QueueError::io(received_dir.join(&filename), e)),
        }
        debug!(id = %entry.id, "acked");
        Ok(())
    }

    /// Drain whatever is waiting; if nothing is, block until something
    /// arrives, the deadline passes or `cancel` fires, then drain again.
    pub fn monitor(
        &self,
        agent: &str,
        options: &DrainOptions,
        deadline: Option<Instant>,
        cancel: &CancelToken,
    ) -> Result<MonitorOutcome, QueueError> {
        let validator = BasicValidator::from_root(self.root());
        let drained = self.drain_with(agent, &validator, options)?;
        if !drained.is_empty() {
            return Ok(MonitorOutcome::Messages(drained));
        }

        match self.watcher(agent)?.wait(deadline, cancel)? {
            WaitOutcome::TimedOut => Ok(MonitorOutcome::TimedOut),
            WaitOutcome::Cancelled => Ok(MonitorOutcome::Cancelled),
            WaitOutcome::Existing(_) | WaitOutcome::NewMessage(_) => {
                let drained = self.drain_with(agent, &validator, options)?;
                if drained.is_empty() {
                    Ok(MonitorOutcome::Empty)
                } else {
                    Ok(MonitorOutcome::Messages(drained))
                }
            }
        }
    }
}
