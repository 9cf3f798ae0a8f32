//! On-disk layout of a queue root
//!
//! ```text
//! <root>/
//!   agents/<handle>/
//!     inbox/{tmp,new,cur}
//!     dlq/{tmp,new,cur}
//!     outbox/sent
//!     acks/{sent,received}
//!   threads/
//!   meta/
//! ```

use crate::io::error::{QueueError, at};
use std::fs;
use std::path::{Path, PathBuf};

/// Which half of a maildir pair an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Folder {
    /// Not yet seen by the application
    New,
    /// Consumed (inbox) or inspected (DLQ)
    Cur,
}

impl Folder {
    pub fn as_str(self) -> &'static str {
        match self {
            Folder::New => "new",
            Folder::Cur => "cur",
        }
    }
}

impl std::fmt::Display for Folder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Path helpers rooted at a queue directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn agent_base(&self, agent: &str) -> PathBuf {
        self.agents_dir().join(agent)
    }

    pub fn inbox_tmp(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("inbox").join("tmp")
    }

    pub fn inbox_new(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("inbox").join("new")
    }

    pub fn inbox_cur(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("inbox").join("cur")
    }

    pub fn inbox(&self, agent: &str, which: Folder) -> PathBuf {
        match which {
            Folder::New => self.inbox_new(agent),
            Folder::Cur => self.inbox_cur(agent),
        }
    }

    pub fn outbox_sent(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("outbox").join("sent")
    }

    pub fn acks_sent(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("acks").join("sent")
    }

    pub fn acks_received(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("acks").join("received")
    }

    pub fn dlq_tmp(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("dlq").join("tmp")
    }

    pub fn dlq_new(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("dlq").join("new")
    }

    pub fn dlq_cur(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("dlq").join("cur")
    }

    pub fn dlq(&self, agent: &str, which: Folder) -> PathBuf {
        match which {
            Folder::New => self.dlq_new(agent),
            Folder::Cur => self.dlq_cur(agent),
        }
    }

    /// Lock file serializing DLQ retries for one agent
    pub fn dlq_lock(&self, agent: &str) -> PathBuf {
        self.agent_base(agent).join("dlq").join("retry.lock")
    }

    pub fn ensure_root_dirs(&self) -> Result<(), QueueError> {
        for dir in [
            self.agents_dir(),
            self.root.join("threads"),
            self.meta_dir(),
        ] {
            create_private_dir(&dir)?;
        }
        Ok(())
    }

    pub fn ensure_agent_dirs(&self, agent: &str) -> Result<(), QueueError> {
        validate_handle(agent)?;
        for dir in [
            self.inbox_tmp(agent),
            self.inbox_new(agent),
            self.inbox_cur(agent),
            self.outbox_sent(agent),
            self.acks_received(agent),
            self.acks_sent(agent),
            self.dlq_tmp(agent),
            self.dlq_new(agent),
            self.dlq_cur(agent),
        ] {
            create_private_dir(&dir)?;
        }
        Ok(())
    }

    /// Agent handles with a directory under `agents/`, sorted.
    ///
    /// A root that has never been initialized has no agents.
    pub fn list_agents(&self) -> Result<Vec<String>, QueueError> {
        let dir = self.agents_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QueueError::io(&dir, e)),
        };
        let mut agents = Vec::new();
        for entry in entries {
            let entry = entry.map_err(at(&dir))?;
            if entry.file_type().map_err(at(&entry.path()))?.is_dir() {
                agents.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        agents.sort();
        Ok(agents)
    }
}

fn create_private_dir(dir: &Path) -> Result<(), QueueError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(at(dir))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).map_err(at(dir))
    }
}

/// Check an agent handle: lowercase letters, digits, `_` and `-`, and no path
/// traversal.
pub fn validate_handle(agent: &str) -> Result<(), QueueError> {
    validate_token("agent handle", agent)
}

/// Check a workflow topic name; same rules as agent handles.
pub fn validate_topic(topic: &str) -> Result<(), QueueError> {
    validate_token("topic name", topic)
}

fn validate_token(kind: &'static str, value: &str) -> Result<(), QueueError> {
    let invalid = |reason| QueueError::InvalidName {
        kind,
        value: value.to_string(),
        reason,
    };
    if value.trim().is_empty() {
        return Err(invalid("is empty"));
    }
    if value.contains("..") || value.contains('/') || value.contains(std::path::MAIN_SEPARATOR) {
        return Err(invalid("contains path traversal"));
    }
    if !is_handle_like(value) {
        return Err(invalid("must match [a-z0-9_-]+"));
    }
    Ok(())
}

pub(crate) fn is_handle_like(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Check that `name` is a single, visible path component usable as a
/// filename inside a mailbox directory.
pub fn validate_filename(name: &str) -> Result<(), QueueError> {
    let invalid = |reason| QueueError::InvalidName {
        kind: "filename",
        value: name.to_string(),
        reason,
    };
    if name.trim().is_empty() {
        return Err(invalid("is empty"));
    }
    if name.starts_with('.') {
        return Err(invalid("must not start with '.'"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("must be a single path component"));
    }
    Ok(())
}
