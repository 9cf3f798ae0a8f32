//! Header validation
//!
//! The codec accepts anything that decodes; this module decides whether a
//! decoded header is acceptable for consumption. A rejected header sends the
//! message to the DLQ with reason `invalid_header`.

use crate::io::error::QueueError;
use crate::io::layout::is_handle_like;
use crate::schema::{CURRENT_SCHEMA, Header, Kind, Priority};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported schema: {0}")]
    UnsupportedSchema(u32),

    #[error("invalid message id: {0:?}")]
    InvalidId(String),

    #[error("invalid {role} handle {value:?}: {reason}")]
    InvalidHandle {
        role: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("missing recipients")]
    MissingRecipients,

    #[error("missing thread")]
    MissingThread,

    #[error("thread contains leading/trailing whitespace")]
    ThreadWhitespace,

    #[error("missing created timestamp")]
    MissingCreated,

    #[error("created timestamp contains leading/trailing whitespace")]
    CreatedWhitespace,

    #[error("invalid created timestamp: {0}")]
    InvalidCreated(String),

    #[error("invalid priority: {0}")]
    InvalidPriority(String),

    #[error("invalid kind: {0}")]
    InvalidKind(String),

    #[error("unknown sender handle: {0}")]
    UnknownSender(String),

    #[error("unknown recipient handle: {0}")]
    UnknownRecipient(String),
}

/// Classifies a decoded header as acceptable or not
pub trait HeaderValidator {
    fn validate(&self, header: &Header) -> Result<(), ValidationError>;
}

/// Structural checks, plus membership in a known-agent set when one is given
#[derive(Debug, Clone, Default)]
pub struct BasicValidator {
    known: Option<HashSet<String>>,
}

impl BasicValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known_agents<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let known: HashSet<String> = agents.into_iter().map(Into::into).collect();
        Self {
            known: (!known.is_empty()).then_some(known),
        }
    }

    /// Build from `<root>/meta/config.json`.
    ///
    /// A missing config disables membership checks. An unreadable or corrupt
    /// one does too, with a warning.
    pub fn from_root(root: &Path) -> Self {
        match load_known_handles(root) {
            Ok(Some(known)) => Self { known: Some(known) },
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(error = %e, "ignoring agent list in config.json");
                Self::default()
            }
        }
    }
}

impl HeaderValidator for BasicValidator {
    fn validate(&self, header: &Header) -> Result<(), ValidationError> {
        validate_basic(header)?;
        let Some(known) = &self.known else {
            return Ok(());
        };
        if !known.contains(&header.from) {
            return Err(ValidationError::UnknownSender(header.from.clone()));
        }
        if let Some(unknown) = header.to.iter().find(|r| !known.contains(*r)) {
            return Err(ValidationError::UnknownRecipient(unknown.clone()));
        }
        Ok(())
    }
}

fn validate_basic(header: &Header) -> Result<(), ValidationError> {
    if header.schema != CURRENT_SCHEMA {
        return Err(ValidationError::UnsupportedSchema(header.schema));
    }
    if safe_id(&header.id).is_none() {
        return Err(ValidationError::InvalidId(header.id.clone()));
    }
    check_handle("sender", &header.from)?;
    if header.to.is_empty() {
        return Err(ValidationError::MissingRecipients);
    }
    for recipient in &header.to {
        check_handle("recipient", recipient)?;
    }

    let thread = header.thread.trim();
    if thread.is_empty() {
        return Err(ValidationError::MissingThread);
    }
    if thread != header.thread {
        return Err(ValidationError::ThreadWhitespace);
    }

    let created = header.created.trim();
    if created.is_empty() {
        return Err(ValidationError::MissingCreated);
    }
    if created != header.created {
        return Err(ValidationError::CreatedWhitespace);
    }
    chrono::DateTime::parse_from_rfc3339(created)
        .map_err(|e| ValidationError::InvalidCreated(e.to_string()))?;

    if let Some(Priority::Other(p)) = &header.priority {
        return Err(ValidationError::InvalidPriority(p.clone()));
    }
    if let Some(Kind::Other(k)) = &header.kind {
        return Err(ValidationError::InvalidKind(k.clone()));
    }
    Ok(())
}

fn check_handle(role: &'static str, value: &str) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidHandle {
        role,
        value: value.to_string(),
        reason,
    };
    if value.trim().is_empty() {
        return Err(invalid("is empty"));
    }
    if value.trim() != value {
        return Err(invalid("not normalized"));
    }
    if !is_handle_like(value) {
        return Err(invalid("allowed: a-z, 0-9, -, _"));
    }
    Ok(())
}

/// `id` if it can serve as a filename stem in a mailbox.
///
/// Used to keep a best-effort identity for messages that fail validation.
pub fn safe_id(id: &str) -> Option<&str> {
    let trimmed = id.trim();
    let unsafe_name = trimmed.is_empty()
        || trimmed != id
        || id.starts_with('.')
        || id.contains('/')
        || id.contains('\\')
        || id.ends_with(".md");
    (!unsafe_name).then_some(id)
}

#[derive(Deserialize)]
struct AgentsConfig {
    #[serde(default)]
    agents: Vec<String>,
}

/// Known agent handles from `<root>/meta/config.json`.
///
/// `Ok(None)` when the file is missing or lists no agents.
pub fn load_known_handles(root: &Path) -> Result<Option<HashSet<String>>, QueueError> {
    let path = root.join("meta").join("config.json");
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(QueueError::io(&path, e)),
    };
    let config: AgentsConfig =
        serde_json::from_slice(&data).map_err(|source| QueueError::Json { path, source })?;
    if config.agents.is_empty() {
        return Ok(None);
    }
    Ok(Some(config.agents.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_header() -> Header {
        Header {
            schema: 1,
            id: "2026-02-11T14-30-00.000Z_pid1_abcd1234".to_string(),
            from: "alice".to_string(),
            to: vec!["bob".to_string()],
            thread: "p2p/alice__bob".to_string(),
            created: "2026-02-11T14:30:00.123456789Z".to_string(),
            priority: Some(Priority::Normal),
            kind: Some(Kind::Status),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_header_passes() {
        assert!(BasicValidator::new().validate(&valid_header()).is_ok());
    }

    fn assert_rejected(mutate: impl FnOnce(&mut Header), expected: ValidationError) {
        let mut header = valid_header();
        mutate(&mut header);
        assert_eq!(BasicValidator::new().validate(&header), Err(expected));
    }

    #[test]
    fn test_structural_failures() {
        assert_rejected(|h| h.schema = 2, ValidationError::UnsupportedSchema(2));
        assert_rejected(|h| h.to.clear(), ValidationError::MissingRecipients);
        assert_rejected(|h| h.thread = "  ".to_string(), ValidationError::MissingThread);
        assert_rejected(|h| h.thread = " t".to_string(), ValidationError::ThreadWhitespace);
        assert_rejected(|h| h.created = String::new(), ValidationError::MissingCreated);
        assert_rejected(
            |h| h.created = "2026-02-11T14:30:00Z ".to_string(),
            ValidationError::CreatedWhitespace,
        );
        assert_rejected(
            |h| h.priority = Some(Priority::Other("asap".to_string())),
            ValidationError::InvalidPriority("asap".to_string()),
        );
        assert_rejected(
            |h| h.kind = Some(Kind::Other("gossip".to_string())),
            ValidationError::InvalidKind("gossip".to_string()),
        );
    }

    #[test]
    fn test_bad_handles_and_ids() {
        let v = BasicValidator::new();

        let mut header = valid_header();
        header.from = "Alice".to_string();
        assert!(matches!(
            v.validate(&header),
            Err(ValidationError::InvalidHandle { role: "sender", .. })
        ));

        let mut header = valid_header();
        header.to = vec!["bob".to_string(), "../x".to_string()];
        assert!(matches!(
            v.validate(&header),
            Err(ValidationError::InvalidHandle { role: "recipient", .. })
        ));

        let mut header = valid_header();
        header.id = "../escape".to_string();
        assert!(matches!(v.validate(&header), Err(ValidationError::InvalidId(_))));

        let mut header = valid_header();
        header.created = "yesterday".to_string();
        assert!(matches!(v.validate(&header), Err(ValidationError::InvalidCreated(_))));
    }

    #[test]
    fn test_known_agents() {
        let v = BasicValidator::with_known_agents(["alice", "bob"]);
        assert!(v.validate(&valid_header()).is_ok());

        let mut header = valid_header();
        header.to.push("carol".to_string());
        assert_eq!(
            v.validate(&header),
            Err(ValidationError::UnknownRecipient("carol".to_string()))
        );

        let mut header = valid_header();
        header.from = "mallory".to_string();
        assert_eq!(
            v.validate(&header),
            Err(ValidationError::UnknownSender("mallory".to_string()))
        );
    }

    #[test]
    fn test_load_known_handles() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        assert!(load_known_handles(root).unwrap().is_none());

        std::fs::create_dir_all(root.join("meta")).unwrap();
        std::fs::write(root.join("meta/config.json"), r#"{"agents":["alice","bob"]}"#).unwrap();
        let known = load_known_handles(root).unwrap().unwrap();
        assert!(known.contains("alice") && known.contains("bob"));

        std::fs::write(root.join("meta/config.json"), "{not json").unwrap();
        assert!(matches!(load_known_handles(root), Err(QueueError::Json { .. })));
        // Lenient construction ignores the corrupt file
        assert!(BasicValidator::from_root(root).validate(&valid_header()).is_ok());
    }

    #[test]
    fn test_safe_id() {
        assert_eq!(safe_id("abc"), Some("abc"));
        assert_eq!(safe_id(""), None);
        assert_eq!(safe_id(".x"), None);
        assert_eq!(safe_id("a/b"), None);
        assert_eq!(safe_id("x.md"), None);
        assert_eq!(safe_id(" x"), None);
    }
}
