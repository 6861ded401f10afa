//! Message envelope exchanged between the overlay and the transport.
//!
//! A [`Message`] carries chat text plus the metadata the overlay needs to
//! route it: its direction, whether its text is ciphertext, and for
//! internal notices the event code that produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Content type of ordinary chat text
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Header holding the text of the message a notice refers to
pub const HEADER_ORIGINAL_TEXT: &str = "original-text";

/// Header holding transport flags passed to `send_message`
pub const HEADER_FLAGS: &str = "flags";

/// Header holding the error behind a notice
pub const HEADER_ERROR: &str = "error";

/// Where a message is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// From the local application to the peer
    ToPeer,
    /// From the peer to the local application
    FromPeer,
    /// Produced by the overlay itself; never forwarded as if from the peer
    Internal,
}

/// A message travelling through the overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier
    pub id: Uuid,
    /// Direction of travel
    pub direction: Direction,
    /// MIME-style content type
    pub content_type: String,
    /// Message text, plaintext or encoded protocol data
    pub text: String,
    /// Event code for internal notices
    pub event: Option<String>,
    /// Free-form metadata
    pub headers: BTreeMap<String, String>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Whether `text` currently holds ciphertext or decrypted text
    pub encrypted: bool,
}

impl Message {
    fn new(direction: Direction, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            direction,
            content_type: CONTENT_TYPE_TEXT.to_string(),
            text: text.into(),
            event: None,
            headers: BTreeMap::new(),
            timestamp: Utc::now(),
            encrypted: false,
        }
    }

    /// A message to the peer
    pub fn outgoing(text: impl Into<String>) -> Self {
        Self::new(Direction::ToPeer, text)
    }

    /// A message from the peer
    pub fn incoming(text: impl Into<String>) -> Self {
        Self::new(Direction::FromPeer, text)
    }

    /// An overlay notice for the local user
    pub fn notice(event: &str, text: impl Into<String>) -> Self {
        let mut message = Self::new(Direction::Internal, text);
        message.event = Some(event.to_string());
        message
    }

    /// Attach a header
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    /// Look up a header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// True for overlay notices
    pub fn is_notice(&self) -> bool {
        self.direction == Direction::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let out = Message::outgoing("hi");
        assert_eq!(out.direction, Direction::ToPeer);
        assert_eq!(out.content_type, CONTENT_TYPE_TEXT);
        assert!(!out.encrypted);

        let notice = Message::notice("received-unencrypted", "careful")
            .with_header(HEADER_ORIGINAL_TEXT, "psst");
        assert!(notice.is_notice());
        assert_eq!(notice.event.as_deref(), Some("received-unencrypted"));
        assert_eq!(notice.header(HEADER_ORIGINAL_TEXT), Some("psst"));
        assert_ne!(out.id, notice.id);
    }

    #[test]
    fn test_serialization() {
        let message = Message::incoming("hello").with_header(HEADER_FLAGS, "3");
        let json = serde_json::to_string(&message).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }
}
