//! DLQ envelope and its file framing
//!
//! ```text
//! ---
//! { envelope JSON }
//! ---
//! <original bytes, verbatim>
//! ```
//!
//! The original payload is carried byte for byte and need not be a valid
//! message; it is whatever failed to parse or validate.

use crate::schema::message::{ParseError, decode_leading_json, trim_leading_whitespace};
use serde::{Deserialize, Serialize};

pub const DLQ_SCHEMA: &str = "amq/dlq/v1";

/// Default bound on non-forced retries
pub const MAX_RETRIES: u32 = 3;

const MARKER: &[u8] = b"---";

/// Why a message was quarantined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Framing or header JSON could not be decoded
    ParseError,
    /// Header decoded but was rejected by validation
    InvalidHeader,
    #[serde(untagged)]
    Other(String),
}

impl FailureReason {
    pub fn as_str(&self) -> &str {
        match self {
            FailureReason::ParseError => "parse_error",
            FailureReason::InvalidHeader => "invalid_header",
            FailureReason::Other(s) => s,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub schema: String,
    pub id: String,
    pub original_id: String,
    pub original_file: String,
    pub failure_reason: FailureReason,
    #[serde(default)]
    pub failure_detail: String,
    pub failure_time: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub source_dir: String,
}

impl DlqEnvelope {
    /// Envelope for a message quarantined from `inbox/new` just now.
    pub fn new(
        original_id: impl Into<String>,
        original_file: impl Into<String>,
        failure_reason: FailureReason,
        failure_detail: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            schema: DLQ_SCHEMA.to_string(),
            id: crate::schema::id::new_dlq_id(now),
            original_id: original_id.into(),
            original_file: original_file.into(),
            failure_reason,
            failure_detail: failure_detail.into(),
            failure_time: now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            retry_count: 0,
            source_dir: "new".to_string(),
        }
    }

    /// Filename of this entry inside `dlq/{new,cur}`
    pub fn filename(&self) -> String {
        crate::schema::id::message_filename(&self.id)
    }

    pub fn failure_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::parse_from_rfc3339(&self.failure_time)
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc))
    }
}

pub fn serialize_dlq(envelope: &DlqEnvelope, original: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header = serde_json::to_vec_pretty(envelope)?;
    let mut out = Vec::with_capacity(header.len() + original.len() + 10);
    out.extend_from_slice(b"---\n");
    out.extend_from_slice(&header);
    out.extend_from_slice(b"\n---\n");
    out.extend_from_slice(original);
    Ok(out)
}

/// Split a DLQ file into its envelope and the verbatim original bytes.
///
/// Marker lines may use CRLF; the original payload is never rewritten.
pub fn parse_dlq(data: &[u8]) -> Result<(DlqEnvelope, Vec<u8>), ParseError> {
    let rest = strip_marker_line(data).ok_or(ParseError::MissingStart)?;
    let (envelope, consumed) = decode_leading_json::<DlqEnvelope>(rest)?;
    let after = trim_leading_whitespace(&rest[consumed..]);
    let body = if after == MARKER {
        &[][..]
    } else {
        strip_marker_line(after).ok_or(ParseError::MissingEnd)?
    };
    Ok((envelope, body.to_vec()))
}

fn strip_marker_line(data: &[u8]) -> Option<&[u8]> {
    let rest = data.strip_prefix(MARKER)?;
    rest.strip_prefix(b"\n")
        .or_else(|| rest.strip_prefix(b"\r\n"))
}
