//! Maildir delivery and promotion
//!
//! Delivery stages the payload in the recipient's own `inbox/tmp` and renames
//! it into `inbox/new`; consumption renames `new` -> `cur`. Rename is the only
//! handoff primitive, so a file is always wholly in one directory and two
//! consumers racing on the same entry produce one winner and one not-found.

use crate::io::atomic::{deliver_via, move_durable, write_file_atomic};
use crate::io::error::QueueError;
use crate::io::layout::{Folder, validate_filename, validate_handle};
use crate::queue::MailQueue;
use crate::schema::{Message, message_filename};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-recipient result of a fan-out delivery
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<(String, PathBuf)>,
    pub failed: Vec<(String, QueueError)>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn delivered_to(&self, agent: &str) -> Option<&Path> {
        self.delivered
            .iter()
            .find(|(a, _)| a == agent)
            .map(|(_, p)| p.as_path())
    }
}

impl MailQueue {
    /// Deliver `data` to `agent`'s `inbox/new/<filename>`.
    pub fn deliver(&self, agent: &str, filename: &str, data: &[u8]) -> Result<PathBuf, QueueError> {
        validate_handle(agent)?;
        validate_filename(filename)?;
        let layout = self.layout();
        let path = deliver_via(
            &layout.inbox_tmp(agent),
            &layout.inbox_new(agent),
            filename,
            data,
            self.dir_sync(),
        )?;
        debug!(agent, filename, "delivered");
        Ok(path)
    }

    /// Deliver the same payload to every recipient independently.
    ///
    /// A failure for one recipient is recorded and delivery continues with
    /// the rest. Duplicate recipients are delivered once.
    pub fn deliver_many(
        &self,
        agents: &[impl AsRef<str>],
        filename: &str,
        data: &[u8],
    ) -> Result<DeliveryReport, QueueError> {
        if agents.is_empty() {
            return Err(QueueError::NoRecipients);
        }
        validate_filename(filename)?;

        let mut report = DeliveryReport::default();
        let mut seen = std::collections::HashSet::new();
        for agent in agents.iter().map(AsRef::as_ref) {
            if !seen.insert(agent) {
                continue;
            }
            match self.deliver(agent, filename, data) {
                Ok(path) => report.delivered.push((agent.to_string(), path)),
                Err(e) => {
                    warn!(agent, filename, error = %e, "delivery to recipient failed");
                    report.failed.push((agent.to_string(), e));
                }
            }
        }
        Ok(report)
    }

    /// Encode `message` and deliver it to every recipient in its header,
    /// keeping a copy in the sender's `outbox/sent`.
    ///
    /// The outbox copy is best-effort and never fails the send.
    pub fn send(&self, message: &Message) -> Result<DeliveryReport, QueueError> {
        let filename = message_filename(&message.header.id);
        let data = message.to_bytes().map_err(|source| QueueError::Json {
            path: PathBuf::from(&filename),
            source,
        })?;
        let report = self.deliver_many(&message.header.to, &filename, &data)?;

        if validate_handle(&message.header.from).is_ok() {
            let outbox = self.layout().outbox_sent(&message.header.from);
            if let Err(e) = write_file_atomic(&outbox, &filename, &data, self.dir_sync()) {
                warn!(from = %message.header.from, error = %e, "failed to write outbox copy");
            }
        }
        Ok(report)
    }

    /// Move `inbox/new/<filename>` to `inbox/cur`.
    ///
    /// If the source is gone but the destination exists, another consumer
    /// already promoted it and this call succeeds.
    pub fn promote(&self, agent: &str, filename: &str) -> Result<PathBuf, QueueError> {
        validate_handle(agent)?;
        validate_filename(filename)?;
        let from = self.layout().inbox_new(agent).join(filename);
        let to = self.layout().inbox_cur(agent).join(filename);
        promote_between(&from, &to, self)
    }

    /// Locate a message in `inbox/new` or `inbox/cur`.
    pub fn find_message(&self, agent: &str, filename: &str) -> Result<(PathBuf, Folder), QueueError> {
        validate_handle(agent)?;
        validate_filename(filename)?;
        find_in(
            [Folder::New, Folder::Cur].map(|f| (f, self.layout().inbox(agent, f))),
            filename,
        )
    }
}

/// Rename `from` -> `to`, treating "already at `to`" as success.
pub(crate) fn promote_between(from: &Path, to: &Path, queue: &MailQueue) -> Result<PathBuf, QueueError> {
    match move_durable(from, to, queue.dir_sync()) {
        Ok(()) => {
            debug!(path = %to.display(), "promoted");
            Ok(to.to_path_buf())
        }
        Err(e) if e.is_not_found() => {
            if to.exists() {
                debug!(path = %to.display(), "already promoted by another consumer");
                Ok(to.to_path_buf())
            } else {
                Err(QueueError::NotFound {
                    path: from.to_path_buf(),
                })
            }
        }
        Err(e) => Err(e),
    }
}

/// First of `dirs` holding `filename`.
pub(crate) fn find_in<const N: usize>(
    dirs: [(Folder, PathBuf); N],
    filename: &str,
) -> Result<(PathBuf, Folder), QueueError> {
    let mut last = None;
    for (folder, dir) in dirs {
        let path = dir.join(filename);
        match std::fs::metadata(&path) {
            Ok(_) => return Ok((path, folder)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => last = Some(path),
            Err(e) => return Err(QueueError::io(&path, e)),
        }
    }
    Err(QueueError::NotFound {
        path: last.unwrap_or_else(|| PathBuf::from(filename)),
    })
}
