//! Core types for the relay.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{RelayError, Result};

/// Class assigned to messages that don't carry one.
pub const DEFAULT_CLASS: &str = "message";

/// Instance assigned to messages that don't carry one.
pub const DEFAULT_INSTANCE: &str = "personal";

/// Unique identifier for a stored message.
///
/// Assigned by the store, strictly increasing in the order inserts commit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A persisted message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier (assigned by store).
    pub id: MessageId,

    /// Who sent it.
    pub sender: String,

    /// Whether the inbound notice carried valid authentication.
    pub authenticated: bool,

    /// Sender-supplied display name, may be empty.
    pub signature: String,

    /// Message text.
    pub body: String,

    /// Read/unread flag, the only mutable field.
    pub read: bool,

    /// Message class.
    pub class: String,

    /// Message instance.
    pub instance: String,

    /// Destination user; `None` means broadcast.
    pub recipient: Option<String>,

    /// When the originating event happened (store receipt time when the
    /// notice carried none). Ordering of query results follows this, not id.
    pub timestamp: Timestamp,
}

/// Input for storing a new message (before id assignment).
#[derive(Clone, Debug, Default)]
pub struct NewMessage {
    pub sender: String,
    pub authenticated: bool,
    pub signature: String,
    pub body: String,
    pub read: bool,
    pub class: String,
    pub instance: String,
    pub recipient: Option<String>,
    /// `None` means the store assigns the receipt time.
    pub timestamp: Option<Timestamp>,
}

/// A unit from the external notice transport, before it is persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notice {
    pub sender: String,

    /// Whether the transport validated the sender.
    pub authenticated: bool,

    /// Empty string = ordinary message; anything else is a control frame
    /// (e.g. a ping) and is discarded on intake.
    pub opcode: String,

    pub class: String,
    pub instance: String,

    /// Destination user; empty = broadcast.
    pub recipient: String,

    /// Origin time, if the transport supplied one.
    pub time: Option<Timestamp>,

    /// Text payload. One field is a bare body; two or more are
    /// signature followed by body.
    pub fields: Vec<String>,
}

impl Notice {
    /// True for ordinary deliverable message content.
    pub fn is_message(&self) -> bool {
        self.opcode.is_empty()
    }

    /// Decode the payload into (signature, body).
    ///
    /// A single field is body-only; with two or more the first is the
    /// signature. Missing fields default to empty.
    pub fn signature_and_body(&self) -> (&str, &str) {
        match self.fields.len() {
            0 => ("", ""),
            1 => ("", self.fields[0].as_str()),
            _ => (self.fields[0].as_str(), self.fields[1].as_str()),
        }
    }
}

/// Read-state to apply when marking messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkStatus {
    Read,
    Unread,
}

impl MarkStatus {
    /// Parse a caller-supplied status. Anything but `"read"`/`"unread"`
    /// is a client error.
    pub fn parse(status: &str) -> Result<Self> {
        match status {
            "read" => Ok(MarkStatus::Read),
            "unread" => Ok(MarkStatus::Unread),
            other => Err(RelayError::InvalidStatus(other.to_string())),
        }
    }

    /// Stored representation of the flag.
    pub fn as_flag(self) -> i64 {
        match self {
            MarkStatus::Read => 1,
            MarkStatus::Unread => 0,
        }
    }
}

/// Per-instance counts within a class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCounts {
    pub instance: String,
    pub unread: i64,
    pub total: i64,
}

/// Per-class counts, annotated with the starred preference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassCounts {
    pub class: String,
    pub unread: i64,
    pub total: i64,
    pub starred: bool,
}

/// Per-sender counts over personal messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderCounts {
    pub sender: String,
    pub unread: i64,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_payload_decoding() {
        let mut notice = Notice {
            sender: "alice".into(),
            authenticated: true,
            opcode: String::new(),
            class: DEFAULT_CLASS.into(),
            instance: DEFAULT_INSTANCE.into(),
            recipient: String::new(),
            time: None,
            fields: vec![],
        };
        assert_eq!(notice.signature_and_body(), ("", ""));

        notice.fields = vec!["just a body".into()];
        assert_eq!(notice.signature_and_body(), ("", "just a body"));

        notice.fields = vec!["Alice".into(), "hello".into(), "extra".into()];
        assert_eq!(notice.signature_and_body(), ("Alice", "hello"));
    }

    #[test]
    fn test_mark_status_parse() {
        assert_eq!(MarkStatus::parse("read").unwrap(), MarkStatus::Read);
        assert_eq!(MarkStatus::parse("unread").unwrap(), MarkStatus::Unread);
        assert!(matches!(
            MarkStatus::parse("seen"),
            Err(RelayError::InvalidStatus(_))
        ));
    }

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp(1) < Timestamp(2));
    }
}
