//! Wire formats carried inside the plaintext transport.
//!
//! Everything the overlay puts on the wire is ordinary text:
//!
//! - the query `?OTRvX?` asks the peer to start a key exchange
//! - `?OTR Error: <text>` reports a protocol error to the peer
//! - `?OTR:<base64>.` wraps a bincode-serialized [`Envelope`]
//! - plaintext may end with a whitespace tag advertising support
//!
//! Anything else is plain chat text.
//!
//! The framing borrows OTR's text conventions but the payload is this
//! crate's own bincode encoding, not OTR's binary format. The overlay
//! therefore advertises its own version marker `X` instead of an OTR
//! version number. OTR clients see a query and a tag offering no version
//! they speak and never start a key exchange with us; we likewise treat
//! their `?OTRv3?` queries and v1/v2/v3 tags as unsupported.

use crate::crypto::ake::{DhCommit, DhKey, RevealSignature, SignatureMessage};
use crate::crypto::smp::{Smp1, Smp2, Smp3, Smp4};
use crate::utils::{EngineError, Result};
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};

/// Envelope format revision. The `X` in the high byte keeps it apart from
/// OTR's small protocol version numbers.
pub const PROTOCOL_VERSION: u16 = 0x5801;

/// Version marker used in query messages
pub const VERSION_MARKER: char = 'X';

/// Query message offering the overlay protocol
pub const QUERY_MESSAGE: &str = "?OTRvX?";

/// Prefix of an encoded protocol message
pub const ENCODED_PREFIX: &str = "?OTR:";

/// Prefix of a protocol error message
pub const ERROR_PREFIX: &str = "?OTR Error:";

/// Whitespace tag announcing protocol support
pub const WHITESPACE_BASE_TAG: &str = " \t  \t\t\t\t \t \t \t  ";

/// Whitespace tag announcing version 1
pub const WHITESPACE_V1_TAG: &str = " \t \t  \t ";

/// Whitespace tag announcing version 2
pub const WHITESPACE_V2_TAG: &str = "  \t\t  \t ";

/// Whitespace tag announcing version 3
pub const WHITESPACE_V3_TAG: &str = "  \t\t  \t\t";

/// Whitespace tag announcing the overlay protocol (`X` as bits)
pub const WHITESPACE_OVERLAY_TAG: &str = " \t \t\t   ";

/// Data flag: the receiver should not complain if it cannot read the message
pub const FLAG_IGNORE_UNREADABLE: u8 = 0x01;

/// Upper bound for the decoded size of an encoded message
pub const MAX_ENCODED_SIZE: usize = crate::MAX_MESSAGE_SIZE;

/// Encoded protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version
    pub version: u16,
    /// Instance tag of the sender
    pub sender_tag: u32,
    /// Instance tag of the intended receiver, zero when unknown
    pub receiver_tag: u32,
    /// Message body
    pub body: Body,
}

/// Body of an encoded protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Body {
    /// Key exchange: commitment
    DhCommit(DhCommit),
    /// Key exchange: responder key
    DhKey(DhKey),
    /// Key exchange: committer reveal
    RevealSignature(RevealSignature),
    /// Key exchange: responder signature
    Signature(SignatureMessage),
    /// Encrypted data
    Data(DataMessage),
}

impl Body {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Body::DhCommit(_) => "dh-commit",
            Body::DhKey(_) => "dh-key",
            Body::RevealSignature(_) => "reveal-signature",
            Body::Signature(_) => "signature",
            Body::Data(_) => "data",
        }
    }
}

/// Encrypted conversation data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMessage {
    /// Message flags, see [`FLAG_IGNORE_UNREADABLE`]
    pub flags: u8,
    /// Strictly increasing per direction; doubles as the nonce
    pub counter: u64,
    /// Sealed [`DataPayload`]
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl DataMessage {
    /// Header bytes authenticated alongside the ciphertext
    pub fn associated_data(&self, sender_tag: u32, receiver_tag: u32) -> Vec<u8> {
        let mut aad = Vec::with_capacity(19);
        aad.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        aad.extend_from_slice(&sender_tag.to_be_bytes());
        aad.extend_from_slice(&receiver_tag.to_be_bytes());
        aad.push(self.flags);
        aad.extend_from_slice(&self.counter.to_be_bytes());
        aad
    }
}

/// Decrypted content of a data message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataPayload {
    /// Chat text, empty for heartbeats and pure control messages
    pub text: String,
    /// Attached control records
    pub tlvs: Vec<Tlv>,
}

/// Control records carried inside data messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Tlv {
    /// Random padding
    Padding(#[serde(with = "serde_bytes")] Vec<u8>),
    /// The sender ended the private conversation
    Disconnected,
    /// SMP step 1
    Smp1(Smp1),
    /// SMP step 1 with a question for the peer
    Smp1Q {
        /// Question shown to the responder
        question: String,
        /// The SMP message
        message: Smp1,
    },
    /// SMP step 2
    Smp2(Smp2),
    /// SMP step 3
    Smp3(Smp3),
    /// SMP step 4
    Smp4(Smp4),
    /// SMP aborted
    SmpAbort,
}

/// Result of looking at an incoming text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// `?OTR:...` message; holds the base64 payload
    Encoded(String),
    /// Query message; `supported` when the overlay protocol is offered
    Query {
        /// Whether the peer offers a version we speak
        supported: bool,
    },
    /// `?OTR Error:` message with its text
    Error(String),
    /// Plaintext with a whitespace tag, tag removed
    Tagged {
        /// Text without the tag
        text: String,
        /// Whether the tag offers a version we speak
        supported: bool,
    },
    /// Plain chat text
    Plain,
}

/// Classify an incoming message text
pub fn classify(text: &str) -> Classified {
    if let Some(start) = text.find(ENCODED_PREFIX) {
        let rest = &text[start + ENCODED_PREFIX.len()..];
        let payload = rest.split('.').next().unwrap_or_default();
        return Classified::Encoded(payload.to_string());
    }

    if let Some(start) = text.find(ERROR_PREFIX) {
        let message = text[start + ERROR_PREFIX.len()..].trim().to_string();
        return Classified::Error(message);
    }

    if let Some(supported) = parse_query(text) {
        return Classified::Query { supported };
    }

    if let Some(start) = text.find(WHITESPACE_BASE_TAG) {
        let mut tags = &text[start + WHITESPACE_BASE_TAG.len()..];
        let mut supported = false;
        loop {
            if let Some(rest) = tags.strip_prefix(WHITESPACE_OVERLAY_TAG) {
                supported = true;
                tags = rest;
            } else if let Some(rest) = tags
                .strip_prefix(WHITESPACE_V3_TAG)
                .or_else(|| tags.strip_prefix(WHITESPACE_V2_TAG))
                .or_else(|| tags.strip_prefix(WHITESPACE_V1_TAG))
            {
                tags = rest;
            } else {
                break;
            }
        }

        let mut stripped = String::with_capacity(text.len());
        stripped.push_str(&text[..start]);
        stripped.push_str(tags);
        return Classified::Tagged {
            text: stripped,
            supported,
        };
    }

    Classified::Plain
}

/// Recognise `?OTR?`, `?OTRv<versions>?` and `?OTR?v<versions>?`
fn parse_query(text: &str) -> Option<bool> {
    let start = text.find("?OTR")?;
    let rest = &text[start + 4..];

    let versions = if let Some(rest) = rest.strip_prefix("?v") {
        rest
    } else if let Some(rest) = rest.strip_prefix('v') {
        rest
    } else if rest.starts_with('?') {
        return Some(false);
    } else {
        return None;
    };

    let end = versions.find('?')?;
    Some(versions[..end].contains(VERSION_MARKER))
}

/// Append the whitespace tag to outgoing plaintext
pub fn tag_plaintext(text: &str) -> String {
    format!("{text}{WHITESPACE_BASE_TAG}{WHITESPACE_OVERLAY_TAG}")
}

/// Build a protocol error message
pub fn error_message(text: &str) -> String {
    format!("{ERROR_PREFIX} {text}")
}

/// Serialize an envelope into its `?OTR:...` form
pub fn encode(envelope: &Envelope) -> Result<String> {
    let bytes = bincode::serialize(envelope)?;
    if bytes.len() > MAX_ENCODED_SIZE {
        return Err(EngineError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_ENCODED_SIZE,
        }
        .into());
    }
    Ok(format!(
        "{ENCODED_PREFIX}{}.",
        general_purpose::STANDARD.encode(bytes)
    ))
}

/// Parse the base64 payload of an encoded message
pub fn decode(payload: &str) -> Result<Envelope> {
    if payload.len() > MAX_ENCODED_SIZE / 3 * 4 + 4 {
        return Err(EngineError::MessageTooLarge {
            size: payload.len() / 4 * 3,
            max: MAX_ENCODED_SIZE,
        }
        .into());
    }

    let bytes = general_purpose::STANDARD.decode(payload.trim())?;
    let envelope: Envelope = bincode::deserialize(&bytes)?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(EngineError::UnsupportedVersion {
            version: envelope.version,
        }
        .into());
    }
    Ok(envelope)
}

/// Serialize a decrypted payload
pub fn encode_payload(payload: &DataPayload) -> Result<Vec<u8>> {
    bincode::serialize(payload).map_err(Into::into)
}

/// Parse a decrypted payload
pub fn decode_payload(bytes: &[u8]) -> Result<DataPayload> {
    bincode::deserialize(bytes).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::OverlayError;

    #[test]
    fn test_classify_query() {
        assert_eq!(
            classify(QUERY_MESSAGE),
            Classified::Query { supported: true }
        );
        assert_eq!(
            classify("hey ?OTRv2X? please"),
            Classified::Query { supported: true }
        );
        assert_eq!(classify("?OTRv2?"), Classified::Query { supported: false });
        assert_eq!(classify("?OTR?"), Classified::Query { supported: false });
        assert_eq!(classify("what?OTRx"), Classified::Plain);
    }

    #[test]
    fn test_classify_whitespace_tag() {
        let tagged = tag_plaintext("hello");
        assert_eq!(
            classify(&tagged),
            Classified::Tagged {
                text: "hello".to_string(),
                supported: true,
            }
        );

        let v2_only = format!("hi{WHITESPACE_BASE_TAG}{WHITESPACE_V2_TAG}");
        assert_eq!(
            classify(&v2_only),
            Classified::Tagged {
                text: "hi".to_string(),
                supported: false,
            }
        );
    }

    #[test]
    fn test_real_otr_versions_are_not_offered() {
        // Our payload is not OTR's binary format, so OTR v3 offers are declined
        assert_eq!(classify("?OTRv3?"), Classified::Query { supported: false });
        assert_eq!(classify("?OTRv23?"), Classified::Query { supported: false });
        let v3 = format!("hi{WHITESPACE_BASE_TAG}{WHITESPACE_V3_TAG}");
        assert_eq!(
            classify(&v3),
            Classified::Tagged {
                text: "hi".to_string(),
                supported: false,
            }
        );

        assert_ne!(QUERY_MESSAGE, "?OTRv3?");
        assert!(!tag_plaintext("hi").contains(WHITESPACE_V3_TAG));
    }

    #[test]
    fn test_classify_error_and_plain() {
        assert_eq!(
            classify(&error_message("not in private")),
            Classified::Error("not in private".to_string())
        );
        assert_eq!(classify("just chatting"), Classified::Plain);
    }

    #[test]
    fn test_encoded_message() {
        let envelope = Envelope {
            version: PROTOCOL_VERSION,
            sender_tag: 0x101,
            receiver_tag: 0,
            body: Body::DhKey(DhKey {
                public_key: [5u8; 32],
            }),
        };
        let text = encode(&envelope).unwrap();
        assert!(text.starts_with(ENCODED_PREFIX));
        assert!(text.ends_with('.'));

        let Classified::Encoded(payload) = classify(&text) else {
            panic!("expected encoded message");
        };
        let decoded = decode(&payload).unwrap();
        assert_eq!(decoded.sender_tag, 0x101);
        assert_eq!(decoded.body.name(), "dh-key");
    }

    #[test]
    fn test_decode_rejects_garbage_and_versions() {
        assert!(decode("!!!").is_err());
        assert!(matches!(
            decode(&general_purpose::STANDARD.encode([1u8, 2, 3])),
            Err(OverlayError::Engine(EngineError::Malformed { .. }))
        ));

        let envelope = Envelope {
            version: 2,
            sender_tag: 0x101,
            receiver_tag: 0,
            body: Body::DhKey(DhKey {
                public_key: [5u8; 32],
            }),
        };
        let text = encode(&envelope).unwrap();
        let Classified::Encoded(payload) = classify(&text) else {
            panic!("expected encoded message");
        };
        assert!(matches!(
            decode(&payload),
            Err(OverlayError::Engine(EngineError::UnsupportedVersion { version: 2 }))
        ));
    }

    #[test]
    fn test_associated_data_binds_header() {
        let message = DataMessage {
            flags: 0,
            counter: 1,
            ciphertext: Vec::new(),
        };
        let mut other = message.clone();
        other.counter = 2;
        assert_ne!(
            message.associated_data(0x101, 0x102),
            other.associated_data(0x101, 0x102)
        );
        assert_ne!(
            message.associated_data(0x101, 0x102),
            message.associated_data(0x102, 0x101)
        );
    }
}
