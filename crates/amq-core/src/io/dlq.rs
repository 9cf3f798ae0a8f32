//! Dead letter queue
//!
//! Messages that fail to parse or validate are wrapped in a [`DlqEnvelope`]
//! and moved to `dlq/new`. From there they can be inspected (`dlq/cur`),
//! redelivered to `inbox/new` a bounded number of times, or purged.

use crate::io::atomic::{deliver_via, deliver_via_exclusive, sync_dir, write_file_atomic};
use crate::io::error::{QueueError, at};
use crate::io::layout::{Folder, validate_filename, validate_handle};
use crate::io::lock::with_lock;
use crate::io::maildir::{find_in, promote_between};
use crate::queue::MailQueue;
use crate::schema::{DlqEnvelope, FailureReason, parse_dlq, serialize_dlq};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// A DLQ file together with its decoded contents
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub path: PathBuf,
    pub folder: Folder,
    pub envelope: DlqEnvelope,
    /// Original message bytes, verbatim
    pub body: Vec<u8>,
}

impl DlqEntry {
    pub fn filename(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// Which DLQ folders to look at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DlqFilter {
    #[default]
    All,
    New,
    Cur,
}

impl DlqFilter {
    fn folders(self) -> &'static [Folder] {
        match self {
            DlqFilter::All => &[Folder::New, Folder::Cur],
            DlqFilter::New => &[Folder::New],
            DlqFilter::Cur => &[Folder::Cur],
        }
    }
}

/// Result of a successful retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutcome {
    /// Where the original landed in `inbox/new`
    pub inbox_path: PathBuf,
    /// Retry count after this retry
    pub retry_count: u32,
    /// False when the redelivery succeeded but the envelope rewrite did not
    pub envelope_updated: bool,
}

#[derive(Debug, Default)]
pub struct RetryAllReport {
    pub retried: Vec<String>,
    pub skipped: Vec<(String, QueueError)>,
}

/// Selects DLQ entries for [`MailQueue::purge_dlq`]
#[derive(Debug, Clone, Default)]
pub struct PurgeFilter {
    /// Only entries whose failure time is at least this old
    pub older_than: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct PurgeReport {
    /// Entries removed, or that would be removed on a dry run
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, QueueError)>,
}

impl MailQueue {
    /// Move `inbox/new/<filename>` into the DLQ.
    ///
    /// The envelope and original bytes are delivered to `dlq/new` first. The
    /// original is then renamed to `inbox/cur` and removed from there, so a
    /// failed delete never leaves the message in neither place. If that rename
    /// fails the original is removed directly; should that fail as well the
    /// message exists both in the inbox and the DLQ and the error is returned.
    pub fn quarantine(
        &self,
        agent: &str,
        filename: &str,
        original_id: &str,
        reason: FailureReason,
        detail: &str,
    ) -> Result<PathBuf, QueueError> {
        validate_handle(agent)?;
        validate_filename(filename)?;
        let layout = self.layout();
        let src = layout.inbox_new(agent).join(filename);
        let original = fs::read(&src).map_err(at(&src))?;

        let envelope = DlqEnvelope::new(original_id, filename, reason, detail);
        let data = encode(&envelope, &original, &src)?;
        let dlq_path = deliver_via(
            &layout.dlq_tmp(agent),
            &layout.dlq_new(agent),
            &envelope.filename(),
            &data,
            self.dir_sync(),
        )?;

        let cur_dir = layout.inbox_cur(agent);
        let parked = cur_dir.join(filename);
        match fs::rename(&src, &parked) {
            Ok(()) => {
                let _ = fs::remove_file(&parked);
                let _ = sync_dir(&cur_dir, self.dir_sync());
            }
            Err(e) => {
                debug!(error = %e, "rename to inbox/cur failed, removing original directly");
                match fs::remove_file(&src) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(QueueError::io(&src, e)),
                }
            }
        }
        let _ = sync_dir(&layout.inbox_new(agent), self.dir_sync());

        debug!(agent, filename, dlq = %dlq_path.display(), reason = %envelope.failure_reason, "quarantined");
        Ok(dlq_path)
    }

    /// Locate a DLQ entry in `dlq/new` or `dlq/cur`.
    pub fn find_dlq(&self, agent: &str, filename: &str) -> Result<(PathBuf, Folder), QueueError> {
        validate_handle(agent)?;
        validate_filename(filename)?;
        find_in(
            [Folder::New, Folder::Cur].map(|f| (f, self.layout().dlq(agent, f))),
            filename,
        )
    }

    /// Read a DLQ entry without moving it.
    pub fn inspect(&self, agent: &str, filename: &str) -> Result<DlqEntry, QueueError> {
        let (path, folder) = self.find_dlq(agent, filename)?;
        read_entry(path, folder)
    }

    /// Mark a DLQ entry as inspected: `dlq/new` -> `dlq/cur`.
    pub fn promote_to_inspected(&self, agent: &str, filename: &str) -> Result<PathBuf, QueueError> {
        validate_handle(agent)?;
        validate_filename(filename)?;
        let from = self.layout().dlq_new(agent).join(filename);
        let to = self.layout().dlq_cur(agent).join(filename);
        promote_between(&from, &to, self)
    }

    /// Redeliver the original message of a DLQ entry to `inbox/new`.
    ///
    /// Refused with [`QueueError::RetryExhausted`] once the retry count has
    /// reached the configured bound, unless `force` is set, and with
    /// [`QueueError::AlreadyInInbox`] if the original filename is already
    /// waiting in `inbox/new`. Redelivery never replaces an entry, including
    /// one a producer delivers concurrently. Concurrent retries for one agent
    /// are serialized through `dlq/retry.lock`.
    ///
    /// The envelope is rewritten in place with the incremented count. That
    /// rewrite is best-effort: once the original is back in the inbox the
    /// call reports success.
    pub fn retry(&self, agent: &str, filename: &str, force: bool) -> Result<RetryOutcome, QueueError> {
        validate_handle(agent)?;
        validate_filename(filename)?;
        with_lock(&self.layout().dlq_lock(agent), || {
            self.retry_locked(agent, filename, force)
        })
    }

    fn retry_locked(&self, agent: &str, filename: &str, force: bool) -> Result<RetryOutcome, QueueError> {
        let (path, folder) = self.find_dlq(agent, filename)?;
        let DlqEntry {
            path,
            mut envelope,
            body,
            ..
        } = read_entry(path, folder)?;

        let max_retries = self.max_retries();
        if envelope.retry_count >= max_retries && !force {
            return Err(QueueError::RetryExhausted { max_retries });
        }

        validate_filename(&envelope.original_file)?;
        let layout = self.layout();
        let inbox_path = deliver_via_exclusive(
            &layout.inbox_tmp(agent),
            &layout.inbox_new(agent),
            &envelope.original_file,
            &body,
            self.dir_sync(),
        )?;

        envelope.retry_count = envelope.retry_count.saturating_add(1);
        let envelope_updated = match self.rewrite_envelope(&path, &envelope, &body) {
            Ok(()) => true,
            Err(e) => {
                warn!(entry = %path.display(), error = %e, "redelivered but failed to update retry count");
                false
            }
        };

        debug!(agent, filename, retry_count = envelope.retry_count, "retried");
        Ok(RetryOutcome {
            inbox_path,
            retry_count: envelope.retry_count,
            envelope_updated,
        })
    }

    fn rewrite_envelope(&self, path: &Path, envelope: &DlqEnvelope, body: &[u8]) -> Result<(), QueueError> {
        let data = encode(envelope, body, path)?;
        let (dir, name) = split_path(path)?;
        write_file_atomic(dir, name, &data, self.dir_sync())?;
        Ok(())
    }

    /// Retry every entry in `dlq/new`, oldest failure first.
    ///
    /// Entries that cannot be retried are reported, not fatal.
    pub fn retry_all(&self, agent: &str, force: bool) -> Result<RetryAllReport, QueueError> {
        let mut entries = self.list_dlq(agent, DlqFilter::New)?;
        entries.reverse();

        let mut report = RetryAllReport::default();
        for entry in entries {
            let name = entry.filename().to_string();
            match self.retry(agent, &name, force) {
                Ok(_) => report.retried.push(entry.envelope.id),
                Err(e) => {
                    warn!(agent, entry = %name, error = %e, "skipping DLQ entry");
                    report.skipped.push((entry.envelope.id, e));
                }
            }
        }
        Ok(report)
    }

    /// DLQ entries in the selected folders, newest failure first.
    ///
    /// Unreadable entries are skipped with a warning. Missing folders count as
    /// empty.
    pub fn list_dlq(&self, agent: &str, filter: DlqFilter) -> Result<Vec<DlqEntry>, QueueError> {
        validate_handle(agent)?;
        let mut entries = Vec::new();
        for &folder in filter.folders() {
            for path in visible_files(&self.layout().dlq(agent, folder))? {
                match read_entry(path.clone(), folder) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => warn!(entry = %path.display(), error = %e, "skipping corrupt DLQ entry"),
                }
            }
        }
        entries.sort_by(|a, b| {
            match (a.envelope.failure_time(), b.envelope.failure_time()) {
                (Some(ta), Some(tb)) => tb.cmp(&ta),
                _ => b.envelope.failure_time.cmp(&a.envelope.failure_time),
            }
            .then_with(|| b.envelope.id.cmp(&a.envelope.id))
        });
        Ok(entries)
    }

    /// Remove DLQ entries from both folders.
    ///
    /// With an age filter, entries whose envelope cannot be read are removed
    /// too, and entries with an unparseable failure time are kept. Each
    /// removal is independent; an entry that vanished meanwhile is ignored.
    pub fn purge_dlq(
        &self,
        agent: &str,
        filter: &PurgeFilter,
        dry_run: bool,
    ) -> Result<PurgeReport, QueueError> {
        validate_handle(agent)?;
        let cutoff = filter.older_than.map(|age| {
            chrono::Duration::from_std(age)
                .ok()
                .and_then(|age| Utc::now().checked_sub_signed(age))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });

        let mut candidates = Vec::new();
        for folder in [Folder::New, Folder::Cur] {
            for path in visible_files(&self.layout().dlq(agent, folder))? {
                if is_purge_candidate(&path, cutoff) {
                    candidates.push(path);
                }
            }
        }

        let mut report = PurgeReport::default();
        if dry_run {
            report.removed = candidates;
            return Ok(report);
        }
        for path in candidates {
            match fs::remove_file(&path) {
                Ok(()) => report.removed.push(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(entry = %path.display(), error = %e, "failed to remove DLQ entry");
                    report.failed.push((path.clone(), QueueError::io(&path, e)));
                }
            }
        }
        for folder in [Folder::New, Folder::Cur] {
            let dir = self.layout().dlq(agent, folder);
            if dir.is_dir() {
                let _ = sync_dir(&dir, self.dir_sync());
            }
        }
        Ok(report)
    }
}

fn is_purge_candidate(path: &Path, cutoff: Option<DateTime<Utc>>) -> bool {
    let Some(cutoff) = cutoff else {
        return true;
    };
    let envelope = match fs::read(path).ok().map(|data| parse_dlq(&data)) {
        Some(Ok((envelope, _))) => envelope,
        _ => return true,
    };
    envelope.failure_time().is_some_and(|t| t <= cutoff)
}

fn encode(envelope: &DlqEnvelope, body: &[u8], path: &Path) -> Result<Vec<u8>, QueueError> {
    serialize_dlq(envelope, body).map_err(|source| QueueError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn read_entry(path: PathBuf, folder: Folder) -> Result<DlqEntry, QueueError> {
    let data = fs::read(&path).map_err(at(&path))?;
    let (envelope, body) = parse_dlq(&data).map_err(|source| QueueError::Envelope {
        path: path.clone(),
        source,
    })?;
    Ok(DlqEntry {
        path,
        folder,
        envelope,
        body,
    })
}

fn split_path(path: &Path) -> Result<(&Path, &str), QueueError> {
    match (path.parent(), path.file_name().and_then(|n| n.to_str())) {
        (Some(dir), Some(name)) => Ok((dir, name)),
        _ => Err(QueueError::InvalidName {
            kind: "path",
            value: path.display().to_string(),
            reason: "has no file name",
        }),
    }
}

/// Regular, non-dot files in `dir`; a missing directory is empty.
pub(crate) fn visible_files(dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(QueueError::io(dir, e)),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(at(dir))?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type().map_err(at(&entry.path()))?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
