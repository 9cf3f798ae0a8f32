//! Collision-resistant, filename-safe identifiers

use chrono::{DateTime, Utc};

/// Message id: `YYYY-MM-DDTHH-MM-SS.mmmZ_pid<pid>_<8 hex>`.
///
/// Colons are replaced so the id can be used directly as a filename stem.
pub fn new_message_id(now: DateTime<Utc>) -> String {
    format!(
        "{}_pid{}_{}",
        now.format("%Y-%m-%dT%H-%M-%S%.3fZ"),
        std::process::id(),
        random_hex(8)
    )
}

/// Filename for a message id.
pub fn message_filename(id: &str) -> String {
    format!("{id}.md")
}

/// DLQ envelope id: `dlq_<unix nanos>_<pid>_<12 hex>`.
pub fn new_dlq_id(now: DateTime<Utc>) -> String {
    format!(
        "dlq_{}_{}_{}",
        now.timestamp_nanos_opt().unwrap_or_default(),
        std::process::id(),
        random_hex(12)
    )
}

fn random_hex(len: usize) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    hex[..len].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::layout::validate_filename;
    use chrono::TimeZone;

    #[test]
    fn test_message_id_format() {
        let now = Utc.with_ymd_and_hms(2026, 2, 11, 14, 30, 5).unwrap();
        let id = new_message_id(now);
        let prefix = format!("2026-02-11T14-30-05.000Z_pid{}_", std::process::id());
        assert!(id.starts_with(&prefix), "{id}");
        let suffix = &id[prefix.len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!id.contains(':'));
        assert!(validate_filename(&message_filename(&id)).is_ok());
    }

    #[test]
    fn test_ids_unique() {
        let now = Utc::now();
        assert_ne!(new_message_id(now), new_message_id(now));
        assert_ne!(new_dlq_id(now), new_dlq_id(now));
    }

    #[test]
    fn test_dlq_id_format() {
        let id = new_dlq_id(Utc::now());
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "dlq");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2], std::process::id().to_string());
        assert_eq!(parts[3].len(), 12);
    }
}
