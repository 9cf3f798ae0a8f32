//! Read receipts for messages sent with `ack_required`

use crate::schema::message::CURRENT_SCHEMA;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub schema: u32,
    pub msg_id: String,
    pub thread: String,
    /// Agent acknowledging the message (the original recipient)
    pub from: String,
    /// Agent that sent the original message
    pub to: String,
    pub received: String,
}

impl Ack {
    pub fn new(
        msg_id: impl Into<String>,
        thread: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        received: DateTime<Utc>,
    ) -> Self {
        Self {
            schema: CURRENT_SCHEMA,
            msg_id: msg_id.into(),
            thread: thread.into(),
            from: from.into(),
            to: to.into(),
            received: received.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        }
    }

    /// Pretty JSON with a trailing newline
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut out = serde_json::to_vec_pretty(self)?;
        out.push(b'\n');
        Ok(out)
    }

    /// Filename of the ack record, keyed by message id
    pub fn filename(&self) -> String {
        format!("{}.json", self.msg_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ack_json() {
        let received = Utc.with_ymd_and_hms(2026, 2, 11, 14, 30, 0).unwrap();
        let ack = Ack::new("m1", "p2p/a__b", "b", "a", received);
        let bytes = ack.to_bytes().unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');

        let parsed: Ack = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, ack);
        assert_eq!(parsed.schema, 1);
        assert_eq!(parsed.received, "2026-02-11T14:30:00.000000000Z");
        assert_eq!(ack.filename(), "m1.json");
    }
}
