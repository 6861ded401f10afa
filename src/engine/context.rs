//! Per-conversation connection context.

use crate::crypto::ake::{Ake, AkeOutcome};
use crate::crypto::cipher::{KEY_SIZE, SSID_SIZE};
use crate::crypto::smp::Smp;
use crate::crypto::{FingerprintValue, PublicKeyBytes};
use crate::engine::{ContextView, FingerprintStore, InstanceTag, MessageState};
use std::time::Instant;

/// Whether we advertised protocol support with a whitespace tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    /// Nothing advertised yet
    NotSent,
    /// A tagged message went out
    Sent,
    /// The peer answered with untagged plaintext
    Rejected,
    /// The peer started a key exchange
    Accepted,
}

/// Keys of the current private conversation
pub struct ActiveKeys {
    pub(crate) send: [u8; KEY_SIZE],
    pub(crate) recv: [u8; KEY_SIZE],
    pub(crate) ssid: [u8; SSID_SIZE],
    pub(crate) their_public_key: PublicKeyBytes,
    pub(crate) send_counter: u64,
    pub(crate) recv_counter: u64,
}

impl std::fmt::Debug for ActiveKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveKeys")
            .field("ssid", &hex::encode(self.ssid))
            .field("keys", &"[REDACTED]")
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish()
    }
}

impl From<AkeOutcome> for ActiveKeys {
    fn from(outcome: AkeOutcome) -> Self {
        let (send, recv) = outcome.data_keys();
        Self {
            send,
            recv,
            ssid: outcome.secrets.ssid,
            their_public_key: outcome.their_public_key,
            send_counter: 0,
            recv_counter: 0,
        }
    }
}

/// Engine-side state of one conversation
#[derive(Debug)]
pub struct ConnContext {
    pub(crate) their_instance: Option<InstanceTag>,
    pub(crate) msg_state: MessageState,
    pub(crate) ake: Ake,
    pub(crate) keys: Option<ActiveKeys>,
    pub(crate) active_fingerprint: Option<FingerprintValue>,
    pub(crate) last_sent: Option<Instant>,
    pub(crate) smp: Smp,
    pub(crate) smp_question: Option<String>,
    pub(crate) offer: OfferState,
}

impl Default for ConnContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnContext {
    /// A fresh plaintext context
    pub fn new() -> Self {
        Self {
            their_instance: None,
            msg_state: MessageState::Plaintext,
            ake: Ake::new(),
            keys: None,
            active_fingerprint: None,
            last_sent: None,
            smp: Smp::new(),
            smp_question: None,
            offer: OfferState::NotSent,
        }
    }

    /// Adopt the result of a completed key exchange
    pub(crate) fn go_encrypted(&mut self, outcome: AkeOutcome, fingerprint: FingerprintValue) {
        self.keys = Some(ActiveKeys::from(outcome));
        self.active_fingerprint = Some(fingerprint);
        self.msg_state = MessageState::Encrypted;
        self.offer = OfferState::Accepted;
        self.last_sent = Some(Instant::now());
        self.smp.abort();
        self.smp_question = None;
    }

    /// Forget keys and drop to `state`
    pub(crate) fn forget_keys(&mut self, state: MessageState) {
        self.keys = None;
        self.msg_state = state;
        self.smp.abort();
        self.smp_question = None;
        if state == MessageState::Plaintext {
            self.active_fingerprint = None;
            self.ake.reset();
        }
    }

    /// Snapshot for callbacks and the session layer
    pub fn view(&self, peer: &str, store: &FingerprintStore) -> ContextView {
        ContextView {
            msg_state: self.msg_state,
            fingerprint: self.active_fingerprint,
            trusted: self
                .active_fingerprint
                .is_some_and(|value| store.is_trusted(peer, &value)),
            their_instance: self.their_instance,
            ssid: self.keys.as_ref().map(|keys| keys.ssid),
            smp: self.smp.phase(),
        }
    }
}
