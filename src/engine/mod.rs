//! OTR-style protocol engine.
//!
//! The engine owns every piece of per-account cryptographic state: the
//! private key, the fingerprint store, the instance tag and one connection
//! context per conversation. It never performs I/O on its own. Everything it
//! wants from the outside world (sending a message, persisting fingerprints,
//! reporting events) goes through the [`EngineOps`] callback trait, passed
//! into each call together with the [`SessionContext`] it concerns.

pub mod context;
pub mod fingerprints;
pub mod policy;
pub mod state;
pub mod storage;
pub mod wire;

pub use fingerprints::{Fingerprint, FingerprintStore};
pub use policy::Policy;
pub use state::{EngineSettings, EngineState, Outgoing, Received};

use crate::account::{AccountIdentity, SessionContext};
use crate::crypto::smp::SmpPhase;
use crate::crypto::FingerprintValue;
use crate::utils::OverlayError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest valid instance tag; lower values are reserved
pub const MIN_INSTANCE_TAG: u32 = 0x100;

/// Distinguishes several clients logged into the same account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceTag(u32);

impl InstanceTag {
    /// Generate a random valid tag
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen_range(MIN_INSTANCE_TAG..=u32::MAX))
    }

    /// Validate a raw tag value
    pub fn from_u32(value: u32) -> Option<Self> {
        (value >= MIN_INSTANCE_TAG).then_some(Self(value))
    }

    /// Raw tag value
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstanceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Protocol state of one conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    /// Messages travel unencrypted
    Plaintext,
    /// Messages are encrypted under keys from a completed key exchange
    Encrypted,
    /// The peer ended the private conversation; nothing may be sent
    Finished,
}

/// Read-only view of a connection context, handed to callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextView {
    /// Current protocol state
    pub msg_state: MessageState,
    /// Fingerprint of the peer key used by the current private conversation
    pub fingerprint: Option<FingerprintValue>,
    /// Whether that fingerprint is trusted
    pub trusted: bool,
    /// Instance tag of the peer's client, once known
    pub their_instance: Option<InstanceTag>,
    /// Secure session id of the current private conversation
    pub ssid: Option<[u8; crate::crypto::cipher::SSID_SIZE]>,
    /// SMP progress
    pub smp: SmpPhase,
}

impl ContextView {
    /// View of a conversation the engine has not seen yet
    pub fn plaintext() -> Self {
        Self {
            msg_state: MessageState::Plaintext,
            fingerprint: None,
            trusted: false,
            their_instance: None,
            ssid: None,
            smp: SmpPhase::Idle,
        }
    }
}

/// Non-fatal protocol conditions reported through
/// [`EngineOps::handle_msg_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageEvent {
    /// Policy requires encryption but the conversation is not private
    EncryptionRequired,
    /// A message could not be encrypted
    EncryptionError,
    /// The peer ended the private conversation; the message was not sent
    ConnectionEnded,
    /// The key exchange failed
    SetupError,
    /// We received our own message back
    MsgReflected,
    /// Encrypted data arrived while the conversation was not private
    RcvdMsgNotInPrivate,
    /// Encrypted data could not be read
    RcvdMsgUnreadable,
    /// A protocol message could not be parsed
    RcvdMsgMalformed,
    /// The peer sent a heartbeat
    LogHeartbeatRcvd,
    /// We sent a heartbeat
    LogHeartbeatSent,
    /// The peer reported a protocol error
    RcvdMsgGeneralErr,
    /// Plaintext arrived where encryption was expected
    RcvdMsgUnencrypted,
    /// A protocol message of unknown kind arrived
    RcvdMsgUnrecognized,
    /// A protocol message addressed to another client instance arrived
    RcvdMsgForOtherInstance,
}

impl MessageEvent {
    /// Stable code carried in notice headers
    pub fn code(self) -> &'static str {
        match self {
            Self::EncryptionRequired => "encryption-required",
            Self::EncryptionError => "encryption-error",
            Self::ConnectionEnded => "connection-ended",
            Self::SetupError => "setup-error",
            Self::MsgReflected => "message-reflected",
            Self::RcvdMsgNotInPrivate => "received-not-in-private",
            Self::RcvdMsgUnreadable => "received-unreadable",
            Self::RcvdMsgMalformed => "received-malformed",
            Self::LogHeartbeatRcvd => "heartbeat-received",
            Self::LogHeartbeatSent => "heartbeat-sent",
            Self::RcvdMsgGeneralErr => "received-general-error",
            Self::RcvdMsgUnencrypted => "received-unencrypted",
            Self::RcvdMsgUnrecognized => "received-unrecognized",
            Self::RcvdMsgForOtherInstance => "received-for-other-instance",
        }
    }

    /// Human-readable description for notices
    pub fn describe(self, peer: &str) -> String {
        match self {
            Self::EncryptionRequired => {
                format!("Attempting to start a private conversation with {peer}; the message was not sent")
            }
            Self::EncryptionError => "An error occurred when encrypting your message; it was not sent".to_string(),
            Self::ConnectionEnded => {
                format!("{peer} has already closed the private connection; end it too or refresh")
            }
            Self::SetupError => format!("Error setting up a private conversation with {peer}"),
            Self::MsgReflected => "Received our own protocol message".to_string(),
            Self::RcvdMsgNotInPrivate => {
                format!("Received an encrypted message from {peer}, but no private conversation exists")
            }
            Self::RcvdMsgUnreadable => format!("Received an unreadable encrypted message from {peer}"),
            Self::RcvdMsgMalformed => format!("Received a malformed message from {peer}"),
            Self::LogHeartbeatRcvd => format!("Heartbeat received from {peer}"),
            Self::LogHeartbeatSent => format!("Heartbeat sent to {peer}"),
            Self::RcvdMsgGeneralErr => format!("Protocol error from {peer}"),
            Self::RcvdMsgUnencrypted => format!("Received an unencrypted message from {peer}"),
            Self::RcvdMsgUnrecognized => format!("Received an unrecognized protocol message from {peer}"),
            Self::RcvdMsgForOtherInstance => {
                format!("Received a message from {peer} addressed to another client instance")
            }
        }
    }

    /// Purely informational events that need no user attention
    pub fn is_log_only(self) -> bool {
        matches!(
            self,
            Self::LogHeartbeatRcvd | Self::LogHeartbeatSent | Self::RcvdMsgForOtherInstance
        )
    }
}

/// SMP progress and outcomes reported through [`EngineOps::handle_smp_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SmpEvent {
    /// The exchange failed internally or a message arrived out of order
    Error,
    /// The exchange was aborted by either side
    Abort,
    /// The peer sent an invalid proof
    Cheated,
    /// The peer asked a question; the answer is needed
    AskForAnswer,
    /// The peer started an exchange; the shared secret is needed
    AskForSecret,
    /// The exchange advanced
    InProgress,
    /// The secrets matched
    Success,
    /// The secrets differed
    Failure,
}

/// Callbacks from the engine into its host.
///
/// Every callback runs while the caller holds the account's engine. An
/// implementation must not try to re-enter the engine.
pub trait EngineOps {
    /// Current encryption policy for a conversation
    fn policy(&self, ctx: &SessionContext) -> Policy;

    /// The account has no private key and needs one. Returns false when no
    /// key is coming, for instance after a failed generation; the engine then
    /// reports a setup error instead of waiting for the key.
    fn create_private_key(&self, account: &AccountIdentity) -> bool;

    /// Whether the peer is online; `None` when unknown
    fn is_logged_in(&self, ctx: &SessionContext) -> Option<bool>;

    /// Send a protocol message to the peer
    fn inject_message(&self, ctx: &SessionContext, message: String);

    /// A fingerprint was seen for the first time
    fn new_fingerprint(&self, ctx: &SessionContext, fingerprint: &FingerprintValue);

    /// The fingerprint store changed and should be persisted
    fn write_fingerprints(&self, account: &AccountIdentity, store: &FingerprintStore);

    /// A private conversation started
    fn gone_secure(&self, ctx: &SessionContext, view: &ContextView);

    /// A private conversation ended
    fn gone_insecure(&self, ctx: &SessionContext, view: &ContextView);

    /// A private conversation was refreshed by a new key exchange
    fn still_secure(&self, ctx: &SessionContext, view: &ContextView, is_reply: bool);

    /// SMP progress; `progress` is a percentage
    fn handle_smp_event(
        &self,
        ctx: &SessionContext,
        event: SmpEvent,
        progress: u8,
        question: Option<&str>,
    );

    /// A non-fatal protocol condition
    fn handle_msg_event(
        &self,
        ctx: &SessionContext,
        event: MessageEvent,
        message: Option<&str>,
        error: Option<&OverlayError>,
    );

    /// The housekeeping poll interval changed; zero stops the timer
    fn timer_control(&self, interval: u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_tag_range() {
        for _ in 0..64 {
            assert!(InstanceTag::generate().value() >= MIN_INSTANCE_TAG);
        }
        assert!(InstanceTag::from_u32(0xff).is_none());
        assert_eq!(InstanceTag::from_u32(0x1234).unwrap().to_string(), "00001234");
    }

    #[test]
    fn test_event_codes_are_unique() {
        let events = [
            MessageEvent::EncryptionRequired,
            MessageEvent::EncryptionError,
            MessageEvent::ConnectionEnded,
            MessageEvent::SetupError,
            MessageEvent::MsgReflected,
            MessageEvent::RcvdMsgNotInPrivate,
            MessageEvent::RcvdMsgUnreadable,
            MessageEvent::RcvdMsgMalformed,
            MessageEvent::LogHeartbeatRcvd,
            MessageEvent::LogHeartbeatSent,
            MessageEvent::RcvdMsgGeneralErr,
            MessageEvent::RcvdMsgUnencrypted,
            MessageEvent::RcvdMsgUnrecognized,
            MessageEvent::RcvdMsgForOtherInstance,
        ];
        let codes: std::collections::HashSet<_> = events.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), events.len());
        assert!(MessageEvent::RcvdMsgUnreadable.describe("bob").contains("bob"));
    }
}
