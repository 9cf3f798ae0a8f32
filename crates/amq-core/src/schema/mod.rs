//! On-disk record types: message files, DLQ envelopes, acks and ids

pub mod ack;
pub mod envelope;
pub mod id;
pub mod message;

pub use ack::Ack;
pub use envelope::{DLQ_SCHEMA, DlqEnvelope, FailureReason, MAX_RETRIES, parse_dlq, serialize_dlq};
pub use id::{message_filename, new_dlq_id, new_message_id};
pub use message::{
    CURRENT_SCHEMA, Header, Kind, MAX_MESSAGE_SIZE, Message, ParseError, Priority, Timestamped,
    parse_header, read_header_file, read_message_file, sort_by_created,
};
