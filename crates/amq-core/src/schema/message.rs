//! Message file codec
//!
//! A message file is a JSON header block followed by a free-form body:
//!
//! ```text
//! ---json
//! {
//!   "schema": 1,
//!   "id": "...",
//!   ...
//! }
//! ---
//! body text
//! ```
//!
//! The closing `---` line is located only after the JSON value has been fully
//! decoded, so body text that happens to contain marker lines is harmless.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fs;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Current header schema version
pub const CURRENT_SCHEMA: u32 = 1;

/// Maximum allowed message file size (10 MiB)
pub const MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024;

const FRONTMATTER_START: &[u8] = b"---json\n";
const FRONTMATTER_END: &[u8] = b"---\n";

/// Errors from decoding a message file
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("missing frontmatter start")]
    MissingStart,

    #[error("missing frontmatter end")]
    MissingEnd,

    #[error("message exceeds maximum size: {size} bytes")]
    TooLarge { size: u64 },

    #[error("parse frontmatter: {0}")]
    Header(#[source] serde_json::Error),

    #[error("message body is not valid UTF-8")]
    BodyNotUtf8,

    #[error("read message: {0}")]
    Io(#[from] std::io::Error),
}

/// Message urgency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    Normal,
    Low,
    /// Value written by a newer or foreign producer; rejected by validation
    #[serde(untagged)]
    Other(String),
}

/// Message classification used by cooperating agents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Brainstorm,
    ReviewRequest,
    ReviewResponse,
    Question,
    Answer,
    Decision,
    Status,
    Todo,
    SpecResearch,
    SpecDraft,
    SpecReview,
    SpecDecision,
    /// Value written by a newer or foreign producer; rejected by validation
    #[serde(untagged)]
    Other(String),
}

/// JSON header stored at the top of each message file
///
/// Decoding is lenient: unknown fields are ignored and missing fields take
/// their defaults. Whether the result is acceptable is decided by a
/// [`HeaderValidator`](crate::validate::HeaderValidator), not by the codec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub schema: u32,
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub thread: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub subject: String,
    pub created: String,
    pub ack_required: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

/// In-memory form of a message file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: String,
}

impl Message {
    /// Encode to the on-disk framing.
    ///
    /// Fills in the schema version and creation time when unset, and ends a
    /// non-empty body with a newline.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut header = self.header.clone();
        if header.schema == 0 {
            header.schema = CURRENT_SCHEMA;
        }
        if header.created.is_empty() {
            header.created =
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        }
        let json = serde_json::to_vec_pretty(&header)?;

        let mut out = Vec::with_capacity(json.len() + self.body.len() + 16);
        out.extend_from_slice(FRONTMATTER_START);
        out.extend_from_slice(&json);
        out.push(b'\n');
        out.extend_from_slice(FRONTMATTER_END);
        out.extend_from_slice(self.body.as_bytes());
        if !self.body.is_empty() && !self.body.ends_with('\n') {
            out.push(b'\n');
        }
        Ok(out)
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (header, body) = split_frontmatter(data)?;
        let body = String::from_utf8(body.into_owned()).map_err(|_| ParseError::BodyNotUtf8)?;
        Ok(Self { header, body })
    }
}

/// Decode only the header of an in-memory message.
pub fn parse_header(data: &[u8]) -> Result<Header, ParseError> {
    split_frontmatter(data).map(|(header, _)| header)
}

pub fn read_message_file(path: &Path) -> Result<Message, ParseError> {
    Message::parse(&read_capped(path)?)
}

pub fn read_header_file(path: &Path) -> Result<Header, ParseError> {
    parse_header(&read_capped(path)?)
}

fn read_capped(path: &Path) -> Result<Vec<u8>, ParseError> {
    let size = fs::metadata(path)?.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(ParseError::TooLarge { size });
    }
    let mut data = Vec::with_capacity(size as usize);
    fs::File::open(path)?
        .take(MAX_MESSAGE_SIZE + 1)
        .read_to_end(&mut data)?;
    if data.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(ParseError::TooLarge {
            size: data.len() as u64,
        });
    }
    Ok(data)
}

fn split_frontmatter(data: &[u8]) -> Result<(Header, Cow<'_, [u8]>), ParseError> {
    if data.len() as u64 > MAX_MESSAGE_SIZE {
        return Err(ParseError::TooLarge {
            size: data.len() as u64,
        });
    }
    let data = normalize_newlines(data);
    if !data.starts_with(FRONTMATTER_START) {
        return Err(ParseError::MissingStart);
    }
    let payload = &data[FRONTMATTER_START.len()..];
    let (header, consumed) = decode_leading_json::<Header>(payload)?;

    let rest = trim_leading_whitespace(&payload[consumed..]);
    let body_start = if rest.starts_with(FRONTMATTER_END) {
        FRONTMATTER_END.len()
    } else if rest == b"---" {
        3
    } else {
        return Err(ParseError::MissingEnd);
    };
    let offset = payload.len() - rest.len() + body_start + FRONTMATTER_START.len();

    let body = match data {
        Cow::Borrowed(bytes) => Cow::Borrowed(&bytes[offset..]),
        Cow::Owned(bytes) => Cow::Owned(bytes[offset..].to_vec()),
    };
    Ok((header, body))
}

/// Decode one JSON value from the front of `payload`, returning it and the
/// number of bytes it occupied.
pub(crate) fn decode_leading_json<T>(payload: &[u8]) -> Result<(T, usize), ParseError>
where
    T: for<'de> Deserialize<'de>,
{
    let mut stream = serde_json::Deserializer::from_slice(payload).into_iter::<T>();
    match stream.next() {
        Some(Ok(value)) => Ok((value, stream.byte_offset())),
        Some(Err(e)) if e.is_eof() => Err(ParseError::MissingEnd),
        Some(Err(e)) => Err(ParseError::Header(e)),
        None => Err(ParseError::MissingEnd),
    }
}

pub(crate) fn trim_leading_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Files edited on Windows arrive with CRLF line endings.
fn normalize_newlines(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.windows(2).any(|w| w == b"\r\n") {
        return Cow::Borrowed(data);
    }
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' && data.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(data[i]);
        i += 1;
    }
    Cow::Owned(out)
}

/// Types ordered by declared creation time, then id
pub trait Timestamped {
    fn created(&self) -> &str;
    fn id(&self) -> &str;
}

impl Timestamped for Header {
    fn created(&self) -> &str {
        &self.created
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Sort oldest first by RFC 3339 creation time, tie-broken by id.
///
/// Items whose timestamp does not parse fall back to string comparison.
pub fn sort_by_created<T: Timestamped>(items: &mut [T]) {
    items.sort_by(compare_created);
}

fn compare_created<T: Timestamped>(a: &T, b: &T) -> Ordering {
    let parsed = (
        chrono::DateTime::parse_from_rfc3339(a.created()),
        chrono::DateTime::parse_from_rfc3339(b.created()),
    );
    let primary = match parsed {
        (Ok(ta), Ok(tb)) => ta.cmp(&tb),
        _ => a.created().cmp(b.created()),
    };
    primary.then_with(|| a.id().cmp(b.id()))
}
