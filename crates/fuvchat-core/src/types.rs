//! Core identifier and value types

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Connection Identifier
// ----------------------------------------------------------------------------

/// Opaque identifier the transport assigns to one live connection.
///
/// The core only indexes by it; it never allocates or frees connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Server-allocated id of a private message. Strictly increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Transfer Identifier
// ----------------------------------------------------------------------------

/// Caller-generated identifier of one file transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Generate a new random transfer ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create from string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// ISO-8601 timestamp as carried on the wire.
///
/// Clients may supply their own; the server stamps one when absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    /// Current UTC time
    pub fn now() -> Self {
        Self(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
    }

    pub fn from_string(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Use a caller-supplied timestamp when it is non-blank, otherwise now
    pub fn or_now(supplied: Option<&str>) -> Self {
        match supplied.map(str::trim) {
            Some(value) if !value.is_empty() => Self(value.to_string()),
            _ => Self::now(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Message Status
// ----------------------------------------------------------------------------

/// Delivery status of a private message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Seen,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_id_generation_is_unique() {
        let a = TransferId::generate();
        let b = TransferId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_timestamp_prefers_supplied_value() {
        let ts = Timestamp::or_now(Some("2024-05-01T10:00:00Z"));
        assert_eq!(ts.as_str(), "2024-05-01T10:00:00Z");

        let stamped = Timestamp::or_now(Some("   "));
        assert!(chrono::DateTime::parse_from_rfc3339(stamped.as_str()).is_ok());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageStatus::Delivered).unwrap(),
            "\"delivered\""
        );
        assert_eq!(serde_json::to_string(&MessageId::new(7)).unwrap(), "7");
    }
}
