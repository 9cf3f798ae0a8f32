//! Inbox scanning
//!
//! One pass over `inbox/new`: every message file becomes an [`InboxEntry`].
//! Files that cannot be decoded or validated are still returned, carrying the
//! failure, so the consumer can quarantine them and keep making progress.

use crate::io::error::{QueueError, at};
use crate::schema::{
    FailureReason, Header, Message, ParseError, Timestamped, read_header_file, read_message_file,
    sort_by_created,
};
use crate::validate::{HeaderValidator, safe_id};
use std::fs;
use std::path::{Path, PathBuf};

/// Why an entry cannot be consumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFailure {
    pub reason: FailureReason,
    pub detail: String,
}

/// A file found in `inbox/new`
#[derive(Debug, Clone, PartialEq)]
pub struct InboxEntry {
    pub filename: String,
    pub path: PathBuf,
    /// Header id when usable, otherwise the filename stem
    pub id: String,
    /// Decoded header; `None` only when decoding failed
    pub header: Option<Header>,
    /// Message body, when requested and readable
    pub body: Option<String>,
    pub failure: Option<ScanFailure>,
}

impl InboxEntry {
    pub fn is_valid(&self) -> bool {
        self.failure.is_none()
    }

    pub fn ack_required(&self) -> bool {
        self.is_valid() && self.header.as_ref().is_some_and(|h| h.ack_required)
    }
}

impl Timestamped for InboxEntry {
    fn created(&self) -> &str {
        match (&self.failure, &self.header) {
            (None, Some(header)) => &header.created,
            _ => "",
        }
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Scan `dir` for message files, oldest first.
///
/// Only non-hidden `*.md` files are considered. A missing directory is empty.
pub fn scan_inbox(
    dir: &Path,
    validator: &dyn HeaderValidator,
    include_body: bool,
) -> Result<Vec<InboxEntry>, QueueError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(QueueError::io(dir, e)),
    };

    let mut entries = Vec::new();
    for dirent in read_dir {
        let dirent = dirent.map_err(at(dir))?;
        let filename = dirent.file_name().to_string_lossy().into_owned();
        if filename.starts_with('.') || !filename.ends_with(".md") {
            continue;
        }
        let file_type = match dirent.file_type() {
            Ok(file_type) => file_type,
            // Consumed by someone else between listing and stat
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(QueueError::io(dirent.path(), e)),
        };
        if file_type.is_dir() {
            continue;
        }
        entries.extend(read_entry(dirent.path(), filename, validator, include_body));
    }

    sort_by_created(&mut entries);
    Ok(entries)
}

fn read_entry(
    path: PathBuf,
    filename: String,
    validator: &dyn HeaderValidator,
    include_body: bool,
) -> Option<InboxEntry> {
    let stem = filename.trim_end_matches(".md").to_string();
    let decoded = if include_body {
        read_message_file(&path).map(|Message { header, body }| (header, Some(body)))
    } else {
        read_header_file(&path).map(|header| (header, None))
    };

    let mut entry = InboxEntry {
        filename,
        path,
        id: stem,
        header: None,
        body: None,
        failure: None,
    };
    match decoded {
        Err(ParseError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            entry.failure = Some(ScanFailure {
                reason: FailureReason::ParseError,
                detail: e.to_string(),
            });
        }
        Ok((header, body)) => {
            if let Err(e) = validator.validate(&header) {
                entry.failure = Some(ScanFailure {
                    reason: FailureReason::InvalidHeader,
                    detail: format!("invalid header: {e}"),
                });
                if let Some(id) = safe_id(&header.id) {
                    entry.id = id.to_string();
                }
            } else {
                entry.id = header.id.clone();
                entry.body = body;
            }
            entry.header = Some(header);
        }
    }
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::BasicValidator;
    use tempfile::TempDir;

    fn valid_message(id: &str, created: &str) -> Vec<u8> {
        Message {
            header: Header {
                schema: 1,
                id: id.to_string(),
                from: "alice".to_string(),
                to: vec!["bob".to_string()],
                thread: "p2p/alice__bob".to_string(),
                created: created.to_string(),
                ack_required: true,
                ..Default::default()
            },
            body: format!("body of {id}"),
        }
        .to_bytes()
        .unwrap()
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let entries = scan_inbox(&temp_dir.path().join("nope"), &BasicValidator::new(), false).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_scan_sorted_and_filtered() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("b.md"), valid_message("b", "2026-02-11T14:30:02Z")).unwrap();
        fs::write(dir.join("a.md"), valid_message("a", "2026-02-11T14:30:01Z")).unwrap();
        fs::write(dir.join(".DS_Store"), b"x").unwrap();
        fs::write(dir.join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.join("sub.md")).unwrap();

        let entries = scan_inbox(dir, &BasicValidator::new(), true).unwrap();

        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(entries.iter().all(InboxEntry::is_valid));
        assert!(entries[0].ack_required());
        assert_eq!(entries[0].body.as_deref(), Some("body of a\n"));
    }

    #[test]
    fn test_scan_without_body() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.md"), valid_message("a", "2026-02-11T14:30:01Z")).unwrap();
        let entries = scan_inbox(temp_dir.path(), &BasicValidator::new(), false).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].body.is_none());
        assert!(entries[0].header.is_some());
    }

    #[test]
    fn test_corrupt_and_invalid_reported_inline() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("good.md"), valid_message("good", "2026-02-11T14:30:01Z")).unwrap();
        fs::write(dir.join("corrupt.md"), b"not valid frontmatter").unwrap();
        fs::write(
            dir.join("invalid.md"),
            b"---json\n{\"schema\":1,\"id\":\"hdr-id\",\"from\":\"alice\",\"to\":[]}\n---\n",
        )
        .unwrap();

        let entries = scan_inbox(dir, &BasicValidator::new(), false).unwrap();
        assert_eq!(entries.len(), 3);

        let corrupt = entries.iter().find(|e| e.filename == "corrupt.md").unwrap();
        let failure = corrupt.failure.as_ref().unwrap();
        assert_eq!(failure.reason, FailureReason::ParseError);
        assert_eq!(failure.detail, "missing frontmatter start");
        assert_eq!(corrupt.id, "corrupt");
        assert!(corrupt.header.is_none());

        let invalid = entries.iter().find(|e| e.filename == "invalid.md").unwrap();
        let failure = invalid.failure.as_ref().unwrap();
        assert_eq!(failure.reason, FailureReason::InvalidHeader);
        assert_eq!(failure.detail, "invalid header: missing recipients");
        assert_eq!(invalid.id, "hdr-id");
        assert!(!invalid.ack_required());

        let good = entries.iter().find(|e| e.filename == "good.md").unwrap();
        assert!(good.is_valid());
    }
}
