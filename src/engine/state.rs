//! Per-account engine state and the protocol state machine.
//!
//! [`EngineState::send`] and [`EngineState::receive`] are the two entry points
//! for conversation traffic. Replies the protocol wants to send on its own
//! (key exchange messages, SMP steps, heartbeats, error reports) leave through
//! [`EngineOps::inject_message`].

use crate::account::{AccountIdentity, SessionContext};
use crate::crypto::ake::CommitReply;
use crate::crypto::cipher;
use crate::crypto::smp::{SmpError, SmpPhase, SmpSecret};
use crate::crypto::{FingerprintValue, PrivateKey};
use crate::engine::context::{ConnContext, OfferState};
use crate::engine::wire::{
    self, Body, Classified, DataMessage, DataPayload, Envelope, Tlv, FLAG_IGNORE_UNREADABLE,
    PROTOCOL_VERSION, QUERY_MESSAGE,
};
use crate::engine::{
    ContextView, EngineOps, FingerprintStore, InstanceTag, MessageEvent, MessageState, Policy,
    SmpEvent,
};
use crate::utils::{EngineError, OtrConfig, OverlayError, Result};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Error text sent to a peer whose data arrived outside a private conversation
const NOT_IN_PRIVATE_ERROR: &str = "You sent encrypted data to a peer who wasn't expecting it.";

/// Error text sent to a peer whose data could not be decrypted
const UNREADABLE_ERROR: &str = "You transmitted an unreadable encrypted message.";

/// Chat text is padded to a multiple of this many bytes
const PADDING_BLOCK: usize = 16;

/// Timing parameters of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Outbound silence after which a heartbeat is sent
    pub heartbeat_interval: Duration,
    /// Age after which an unfinished key exchange is dropped
    pub ake_timeout: Duration,
    /// Housekeeping interval while a conversation is private
    pub poll_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(crate::defaults::DEFAULT_HEARTBEAT_INTERVAL),
            ake_timeout: Duration::from_secs(crate::defaults::DEFAULT_AKE_TIMEOUT),
            poll_interval: Duration::from_secs(crate::defaults::DEFAULT_POLL_INTERVAL),
        }
    }
}

impl From<&OtrConfig> for EngineSettings {
    fn from(config: &OtrConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval),
            ake_timeout: Duration::from_secs(config.ake_timeout),
            poll_interval: Duration::from_secs(config.poll_interval),
        }
    }
}

/// What to put on the wire for an outgoing chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Send as plaintext, possibly with a whitespace tag appended
    Plaintext(String),
    /// Send this encoded data message instead
    Encrypted(String),
}

impl Outgoing {
    /// The text to transmit
    pub fn into_text(self) -> String {
        match self {
            Outgoing::Plaintext(text) | Outgoing::Encrypted(text) => text,
        }
    }
}

/// How an incoming message was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Ordinary plaintext to show, whitespace tag removed
    Plaintext(String),
    /// Decrypted chat text
    Decrypted(String),
    /// Protocol message, consumed
    Internal,
    /// The message needs the account's private key, which is being generated
    NeedsPrivateKey,
    /// Not deliverable; a message event explains why
    Error,
}

/// Cryptographic state of one local account
#[derive(Debug)]
pub struct EngineState {
    account: AccountIdentity,
    settings: EngineSettings,
    private_key: Option<PrivateKey>,
    fingerprints: FingerprintStore,
    instance_tag: InstanceTag,
    contexts: HashMap<SessionContext, ConnContext>,
    timer_interval: u64,
}

impl EngineState {
    /// Assemble engine state from loaded parts
    pub fn new(
        account: AccountIdentity,
        settings: EngineSettings,
        private_key: Option<PrivateKey>,
        fingerprints: FingerprintStore,
        instance_tag: InstanceTag,
    ) -> Self {
        Self {
            account,
            settings,
            private_key,
            fingerprints,
            instance_tag,
            contexts: HashMap::new(),
            timer_interval: 0,
        }
    }

    /// The owning account
    pub fn account(&self) -> &AccountIdentity {
        &self.account
    }

    /// Our instance tag
    pub fn instance_tag(&self) -> InstanceTag {
        self.instance_tag
    }

    /// The account's private key, if it has one
    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    /// Install a freshly generated private key
    pub fn install_private_key(&mut self, key: PrivateKey) {
        log::info!(
            "Installed private key {} for {}",
            key.fingerprint(),
            self.account
        );
        self.private_key = Some(key);
    }

    /// Known fingerprints
    pub fn fingerprints(&self) -> &FingerprintStore {
        &self.fingerprints
    }

    /// Current poll interval in seconds, zero when idle
    pub fn timer_interval(&self) -> u64 {
        self.timer_interval
    }

    /// The message that asks a peer to start a private conversation
    pub fn query_message(&self) -> &'static str {
        QUERY_MESSAGE
    }

    /// Snapshot of a conversation
    pub fn context_view(&self, ctx: &SessionContext) -> ContextView {
        self.contexts
            .get(ctx)
            .map(|conn| conn.view(&ctx.peer_name, &self.fingerprints))
            .unwrap_or_else(ContextView::plaintext)
    }

    /// Whether a non-plaintext conversation with `peer` uses `value`
    pub fn fingerprint_in_use(&self, ctx: &SessionContext, value: &FingerprintValue) -> bool {
        self.contexts.get(ctx).is_some_and(|conn| {
            conn.msg_state != MessageState::Plaintext && conn.active_fingerprint.as_ref() == Some(value)
        })
    }

    /// Change the trust flag of a known fingerprint
    pub fn set_trust(&mut self, peer: &str, value: &FingerprintValue, trusted: bool) -> bool {
        self.fingerprints.set_trusted(peer, value, trusted)
    }

    /// Delete a known fingerprint
    pub fn forget_fingerprint(&mut self, peer: &str, value: &FingerprintValue) -> bool {
        self.fingerprints.remove(peer, value)
    }

    /// Drop the connection context of a conversation
    pub fn forget_context(&mut self, ctx: &SessionContext) {
        self.contexts.remove(ctx);
    }

    /// Process an outgoing chat message.
    ///
    /// # Errors
    ///
    /// Fails when the policy requires encryption but the conversation is not
    /// private, when the peer already ended the private conversation, or when
    /// encryption fails. A message event is raised in each case.
    pub fn send(&mut self, ops: &dyn EngineOps, ctx: &SessionContext, text: &str) -> Result<Outgoing> {
        let policy = ops.policy(ctx);
        if !policy.allows_encryption() {
            return Ok(Outgoing::Plaintext(text.to_string()));
        }

        let mut conn = self.contexts.remove(ctx).unwrap_or_default();
        let result = self.send_in(ops, ctx, &mut conn, policy, text);
        self.contexts.insert(ctx.clone(), conn);
        self.update_timer(ops);
        result
    }

    fn send_in(
        &self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        policy: Policy,
        text: &str,
    ) -> Result<Outgoing> {
        match conn.msg_state {
            MessageState::Plaintext => {
                if policy.requires_encryption() {
                    let key_coming =
                        self.private_key.is_some() || ops.create_private_key(&self.account);
                    if key_coming && !conn.ake.in_progress() {
                        ops.inject_message(ctx, QUERY_MESSAGE.to_string());
                    }
                    ops.handle_msg_event(ctx, MessageEvent::EncryptionRequired, Some(text), None);
                    return Err(EngineError::PolicyViolation {
                        policy: policy.to_string(),
                    }
                    .into());
                }

                if policy.sends_whitespace_tag() && conn.offer != OfferState::Rejected {
                    conn.offer = OfferState::Sent;
                    return Ok(Outgoing::Plaintext(wire::tag_plaintext(text)));
                }
                Ok(Outgoing::Plaintext(text.to_string()))
            }
            MessageState::Encrypted => match self.seal_data(ctx, conn, text, Vec::new(), 0) {
                Ok(encoded) => Ok(Outgoing::Encrypted(encoded)),
                Err(err) => {
                    log::error!("Failed to encrypt message to {}: {}", ctx, err);
                    ops.handle_msg_event(ctx, MessageEvent::EncryptionError, Some(text), Some(&err));
                    Err(err)
                }
            },
            MessageState::Finished => {
                ops.handle_msg_event(ctx, MessageEvent::ConnectionEnded, Some(text), None);
                Err(EngineError::NotEncrypted {
                    peer: ctx.peer_name.clone(),
                }
                .into())
            }
        }
    }

    /// Process an incoming message
    pub fn receive(&mut self, ops: &dyn EngineOps, ctx: &SessionContext, text: &str) -> Received {
        let policy = ops.policy(ctx);
        if !policy.allows_encryption() {
            return Received::Plaintext(text.to_string());
        }

        let mut conn = self.contexts.remove(ctx).unwrap_or_default();
        let received = self.receive_in(ops, ctx, &mut conn, policy, text);
        self.contexts.insert(ctx.clone(), conn);
        self.update_timer(ops);
        received
    }

    fn receive_in(
        &mut self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        policy: Policy,
        text: &str,
    ) -> Received {
        match wire::classify(text) {
            Classified::Encoded(payload) => match wire::decode(&payload) {
                Ok(envelope) => self.receive_envelope(ops, ctx, conn, envelope),
                Err(err) => {
                    log::warn!("Malformed protocol message from {}: {}", ctx, err);
                    ops.handle_msg_event(ctx, MessageEvent::RcvdMsgMalformed, None, Some(&err));
                    Received::Error
                }
            },
            Classified::Query { supported: true } => self.start_ake(ops, ctx, conn),
            Classified::Query { supported: false } => {
                ops.handle_msg_event(ctx, MessageEvent::RcvdMsgUnrecognized, Some(text), None);
                Received::Error
            }
            Classified::Error(message) => {
                ops.handle_msg_event(ctx, MessageEvent::RcvdMsgGeneralErr, Some(&message), None);
                if policy.starts_on_error() {
                    ops.inject_message(ctx, QUERY_MESSAGE.to_string());
                }
                Received::Error
            }
            Classified::Tagged { text, supported } => {
                if supported
                    && policy.starts_on_whitespace()
                    && conn.msg_state == MessageState::Plaintext
                    && self.start_ake(ops, ctx, conn) == Received::NeedsPrivateKey
                {
                    return Received::NeedsPrivateKey;
                }
                self.receive_plaintext(ops, ctx, conn, policy, text, true)
            }
            Classified::Plain => self.receive_plaintext(ops, ctx, conn, policy, text.to_string(), false),
        }
    }

    fn receive_plaintext(
        &self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        policy: Policy,
        text: String,
        tagged: bool,
    ) -> Received {
        match conn.msg_state {
            MessageState::Plaintext => {
                if !tagged && conn.offer == OfferState::Sent {
                    conn.offer = OfferState::Rejected;
                }
                if policy.requires_encryption() {
                    ops.handle_msg_event(ctx, MessageEvent::RcvdMsgUnencrypted, Some(&text), None);
                    Received::Error
                } else {
                    Received::Plaintext(text)
                }
            }
            MessageState::Encrypted | MessageState::Finished => {
                ops.handle_msg_event(ctx, MessageEvent::RcvdMsgUnencrypted, Some(&text), None);
                Received::Error
            }
        }
    }

    fn start_ake(&self, ops: &dyn EngineOps, ctx: &SessionContext, conn: &mut ConnContext) -> Received {
        if self.private_key.is_none() {
            return self.request_private_key(ops, ctx);
        }

        log::debug!("Starting key exchange with {}", ctx);
        let commit = conn.ake.start();
        self.inject_envelope(ops, ctx, 0, Body::DhCommit(commit));
        Received::Internal
    }

    /// Ask the host for a key. The message waits for it when one is coming
    /// and is otherwise rejected with a setup error.
    fn request_private_key(&self, ops: &dyn EngineOps, ctx: &SessionContext) -> Received {
        if ops.create_private_key(&self.account) {
            return Received::NeedsPrivateKey;
        }
        let err: OverlayError = EngineError::NoPrivateKey {
            account: self.account.account_id.clone(),
        }
        .into();
        ops.handle_msg_event(ctx, MessageEvent::SetupError, None, Some(&err));
        Received::Error
    }

    fn receive_envelope(
        &mut self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        envelope: Envelope,
    ) -> Received {
        let Some(sender) = InstanceTag::from_u32(envelope.sender_tag) else {
            let err: OverlayError = EngineError::Malformed {
                reason: format!("invalid sender instance tag {:#x}", envelope.sender_tag),
            }
            .into();
            ops.handle_msg_event(ctx, MessageEvent::RcvdMsgMalformed, None, Some(&err));
            return Received::Error;
        };

        if sender == self.instance_tag {
            ops.handle_msg_event(ctx, MessageEvent::MsgReflected, None, None);
            return Received::Error;
        }
        if envelope.receiver_tag != 0 && envelope.receiver_tag != self.instance_tag.value() {
            log::debug!("Ignoring {} message for another instance from {}", envelope.body.name(), ctx);
            ops.handle_msg_event(ctx, MessageEvent::RcvdMsgForOtherInstance, None, None);
            return Received::Error;
        }

        log::trace!("Received {} from {}", envelope.body.name(), ctx);
        let our_tag = self.instance_tag.value();

        match envelope.body {
            Body::DhCommit(commit) => {
                if self.private_key.is_none() {
                    return self.request_private_key(ops, ctx);
                }
                conn.their_instance = Some(sender);
                let reply = match conn.ake.handle_commit(&commit) {
                    CommitReply::Resend(commit) => Body::DhCommit(commit),
                    CommitReply::DhKey(key) => Body::DhKey(key),
                };
                let receiver = match reply {
                    Body::DhCommit(_) => 0,
                    _ => sender.value(),
                };
                self.inject_envelope(ops, ctx, receiver, reply);
                Received::Internal
            }
            Body::DhKey(key) => {
                let Some(private_key) = self.private_key.as_ref() else {
                    return Received::Internal;
                };
                match conn.ake.handle_dh_key(&key, private_key, our_tag) {
                    Ok(Some(reveal)) => {
                        conn.their_instance = Some(sender);
                        self.inject_envelope(ops, ctx, sender.value(), Body::RevealSignature(reveal));
                    }
                    Ok(None) => {}
                    Err(err) => self.ake_failed(ops, ctx, conn, &err),
                }
                Received::Internal
            }
            Body::RevealSignature(reveal) => {
                let Some(private_key) = self.private_key.as_ref() else {
                    return Received::Internal;
                };
                match conn
                    .ake
                    .handle_reveal_signature(&reveal, private_key, our_tag, sender.value())
                {
                    Ok(Some((signature, outcome))) => {
                        conn.their_instance = Some(sender);
                        self.inject_envelope(ops, ctx, sender.value(), Body::Signature(signature));
                        self.complete_ake(ops, ctx, conn, outcome, true);
                    }
                    Ok(None) => {}
                    Err(err) => self.ake_failed(ops, ctx, conn, &err),
                }
                Received::Internal
            }
            Body::Signature(signature) => {
                match conn.ake.handle_signature(&signature, sender.value()) {
                    Ok(Some(outcome)) => self.complete_ake(ops, ctx, conn, outcome, false),
                    Ok(None) => {}
                    Err(err) => self.ake_failed(ops, ctx, conn, &err),
                }
                Received::Internal
            }
            Body::Data(data) => {
                self.receive_data(ops, ctx, conn, sender, envelope.receiver_tag, data)
            }
        }
    }

    fn ake_failed(
        &self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        err: &OverlayError,
    ) {
        log::warn!("Key exchange with {} failed: {}", ctx, err);
        conn.ake.reset();
        ops.handle_msg_event(ctx, MessageEvent::SetupError, None, Some(err));
    }

    fn complete_ake(
        &mut self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        outcome: crate::crypto::ake::AkeOutcome,
        is_reply: bool,
    ) {
        let fingerprint = FingerprintValue::of_public_key(&outcome.their_public_key);
        if self.fingerprints.add(&ctx.peer_name, fingerprint) {
            log::info!("New fingerprint for {}: {}", ctx.peer_name, fingerprint);
            ops.new_fingerprint(ctx, &fingerprint);
            ops.write_fingerprints(&self.account, &self.fingerprints);
        }

        let refreshed = conn.msg_state == MessageState::Encrypted
            && conn.active_fingerprint == Some(fingerprint);
        conn.go_encrypted(outcome, fingerprint);

        let view = conn.view(&ctx.peer_name, &self.fingerprints);
        if refreshed {
            log::info!("Private conversation with {} refreshed", ctx);
            ops.still_secure(ctx, &view, is_reply);
        } else {
            log::info!("Private conversation with {} started", ctx);
            ops.gone_secure(ctx, &view);
        }
    }

    fn receive_data(
        &mut self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        sender: InstanceTag,
        receiver_tag: u32,
        data: DataMessage,
    ) -> Received {
        let ignore_unreadable = data.flags & FLAG_IGNORE_UNREADABLE != 0;
        let from_peer = conn.their_instance == Some(sender);

        let keys = match conn.keys.as_mut() {
            Some(keys) if conn.msg_state == MessageState::Encrypted && from_peer => keys,
            _ => {
                if ignore_unreadable {
                    return Received::Internal;
                }
                ops.handle_msg_event(ctx, MessageEvent::RcvdMsgNotInPrivate, None, None);
                ops.inject_message(ctx, wire::error_message(NOT_IN_PRIVATE_ERROR));
                return Received::Error;
            }
        };

        if data.counter <= keys.recv_counter {
            let err: OverlayError = EngineError::Malformed {
                reason: format!("replayed counter {}", data.counter),
            }
            .into();
            return unreadable(ops, ctx, ignore_unreadable, &err);
        }

        let aad = data.associated_data(sender.value(), receiver_tag);
        let plaintext = match cipher::open(&keys.recv, data.counter, &aad, &data.ciphertext) {
            Ok(plaintext) => plaintext,
            Err(err) => return unreadable(ops, ctx, ignore_unreadable, &err),
        };
        let payload = match wire::decode_payload(&plaintext) {
            Ok(payload) => payload,
            Err(err) => {
                ops.handle_msg_event(ctx, MessageEvent::RcvdMsgMalformed, None, Some(&err));
                return Received::Error;
            }
        };
        keys.recv_counter = data.counter;

        let mut control = false;
        for tlv in payload.tlvs {
            match tlv {
                Tlv::Padding(_) => {}
                Tlv::Disconnected => {
                    control = true;
                    log::info!("{} ended the private conversation", ctx.peer_name);
                    conn.forget_keys(MessageState::Finished);
                    let view = conn.view(&ctx.peer_name, &self.fingerprints);
                    ops.gone_insecure(ctx, &view);
                }
                smp => {
                    control = true;
                    self.handle_smp_tlv(ops, ctx, conn, smp);
                }
            }
        }

        if payload.text.is_empty() {
            if !control {
                ops.handle_msg_event(ctx, MessageEvent::LogHeartbeatRcvd, None, None);
            }
            return Received::Internal;
        }

        self.maybe_heartbeat(ops, ctx, conn);
        Received::Decrypted(payload.text)
    }

    fn maybe_heartbeat(&self, ops: &dyn EngineOps, ctx: &SessionContext, conn: &mut ConnContext) {
        if conn.msg_state != MessageState::Encrypted {
            return;
        }
        let quiet = conn
            .last_sent
            .map_or(true, |sent| sent.elapsed() >= self.settings.heartbeat_interval);
        if !quiet {
            return;
        }

        match self.seal_data(ctx, conn, "", Vec::new(), FLAG_IGNORE_UNREADABLE) {
            Ok(heartbeat) => {
                ops.inject_message(ctx, heartbeat);
                ops.handle_msg_event(ctx, MessageEvent::LogHeartbeatSent, None, None);
            }
            Err(err) => log::warn!("Failed to send heartbeat to {}: {}", ctx, err),
        }
    }

    fn handle_smp_tlv(
        &mut self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        tlv: Tlv,
    ) {
        let outcome = match tlv {
            Tlv::Smp1(message) => conn.smp.receive_smp1(&message).map(|()| {
                conn.smp_question = None;
                ops.handle_smp_event(ctx, SmpEvent::AskForSecret, 25, None);
            }),
            Tlv::Smp1Q { question, message } => conn.smp.receive_smp1(&message).map(|()| {
                ops.handle_smp_event(ctx, SmpEvent::AskForAnswer, 25, Some(&question));
                conn.smp_question = Some(question);
            }),
            Tlv::Smp2(message) => match conn.smp.receive_smp2(&message) {
                Ok(reply) => {
                    self.send_control(ops, ctx, conn, Tlv::Smp3(reply));
                    ops.handle_smp_event(ctx, SmpEvent::InProgress, 60, None);
                    Ok(())
                }
                Err(err) => Err(err),
            },
            Tlv::Smp3(message) => match conn.smp.receive_smp3(&message) {
                Ok((reply, matched)) => {
                    self.send_control(ops, ctx, conn, Tlv::Smp4(reply));
                    self.smp_finished(ops, ctx, conn, matched);
                    Ok(())
                }
                Err(err) => Err(err),
            },
            Tlv::Smp4(message) => match conn.smp.receive_smp4(&message) {
                Ok(matched) => {
                    self.smp_finished(ops, ctx, conn, matched);
                    Ok(())
                }
                Err(err) => Err(err),
            },
            Tlv::SmpAbort => {
                conn.smp.abort();
                conn.smp_question = None;
                ops.handle_smp_event(ctx, SmpEvent::Abort, 0, None);
                Ok(())
            }
            Tlv::Padding(_) | Tlv::Disconnected => Ok(()),
        };

        if let Err(err) = outcome {
            log::warn!("SMP with {} stopped: {}", ctx, err);
            conn.smp.abort();
            conn.smp_question = None;
            self.send_control(ops, ctx, conn, Tlv::SmpAbort);
            let event = match err {
                SmpError::Cheated => SmpEvent::Cheated,
                SmpError::OutOfOrder => SmpEvent::Error,
            };
            ops.handle_smp_event(ctx, event, 0, None);
        }
    }

    fn smp_finished(
        &mut self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        matched: bool,
    ) {
        conn.smp_question = None;
        if !matched {
            log::info!("SMP with {} failed: secrets differ", ctx);
            ops.handle_smp_event(ctx, SmpEvent::Failure, 100, None);
            return;
        }

        if let Some(fingerprint) = conn.active_fingerprint {
            log::info!("SMP with {} succeeded; trusting {}", ctx, fingerprint);
            self.fingerprints.set_trusted(&ctx.peer_name, &fingerprint, true);
            ops.write_fingerprints(&self.account, &self.fingerprints);
        }
        ops.handle_smp_event(ctx, SmpEvent::Success, 100, None);
    }

    /// End the private conversation, telling the peer if it is online
    pub fn disconnect(&mut self, ops: &dyn EngineOps, ctx: &SessionContext) {
        let Some(mut conn) = self.contexts.remove(ctx) else {
            return;
        };

        let previous = conn.msg_state;
        if previous == MessageState::Encrypted && ops.is_logged_in(ctx) != Some(false) {
            match self.seal_data(
                ctx,
                &mut conn,
                "",
                vec![Tlv::Disconnected],
                FLAG_IGNORE_UNREADABLE,
            ) {
                Ok(message) => ops.inject_message(ctx, message),
                Err(err) => log::warn!("Failed to notify {} of disconnect: {}", ctx, err),
            }
        }

        conn.forget_keys(MessageState::Plaintext);
        if previous != MessageState::Plaintext {
            log::info!("Private conversation with {} closed", ctx);
            let view = conn.view(&ctx.peer_name, &self.fingerprints);
            ops.gone_insecure(ctx, &view);
        }

        self.contexts.insert(ctx.clone(), conn);
        self.update_timer(ops);
    }

    /// Start SMP, optionally with a question for the peer
    ///
    /// # Errors
    ///
    /// Fails when the conversation is not private
    pub fn smp_start(
        &mut self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        question: Option<&str>,
        secret: &[u8],
    ) -> Result<()> {
        let mut conn = self.contexts.remove(ctx).unwrap_or_default();
        let result = self.smp_start_in(ops, ctx, &mut conn, question, secret);
        self.contexts.insert(ctx.clone(), conn);
        result
    }

    fn smp_start_in(
        &self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        question: Option<&str>,
        secret: &[u8],
    ) -> Result<()> {
        let (ours, theirs, ssid) = self.smp_identities(ctx, conn)?;
        let message = conn.smp.start(&SmpSecret::derive(&ours, &theirs, &ssid, secret));
        let tlv = match question {
            Some(question) => Tlv::Smp1Q {
                question: question.to_string(),
                message,
            },
            None => Tlv::Smp1(message),
        };

        let encoded = self.seal_data(ctx, conn, "", vec![tlv], FLAG_IGNORE_UNREADABLE)?;
        ops.inject_message(ctx, encoded);
        ops.handle_smp_event(ctx, SmpEvent::InProgress, 20, question);
        Ok(())
    }

    /// Answer the peer's SMP request with our secret
    ///
    /// # Errors
    ///
    /// Fails when no request is pending
    pub fn smp_respond(
        &mut self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        secret: &[u8],
    ) -> Result<()> {
        let mut conn = self.contexts.remove(ctx).unwrap_or_default();
        let result = self.smp_respond_in(ops, ctx, &mut conn, secret);
        self.contexts.insert(ctx.clone(), conn);
        result
    }

    fn smp_respond_in(
        &self,
        ops: &dyn EngineOps,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        secret: &[u8],
    ) -> Result<()> {
        if conn.smp.phase() != SmpPhase::AwaitingSecret {
            return Err(EngineError::InvalidSmpState {
                state: format!("{:?}", conn.smp.phase()),
            }
            .into());
        }

        let (ours, theirs, ssid) = self.smp_identities(ctx, conn)?;
        let reply = conn
            .smp
            .respond(&SmpSecret::derive(&theirs, &ours, &ssid, secret))
            .map_err(|err| EngineError::InvalidSmpState {
                state: err.to_string(),
            })?;

        let encoded = self.seal_data(ctx, conn, "", vec![Tlv::Smp2(reply)], FLAG_IGNORE_UNREADABLE)?;
        ops.inject_message(ctx, encoded);
        ops.handle_smp_event(ctx, SmpEvent::InProgress, 60, None);
        Ok(())
    }

    /// Abort SMP in progress, telling the peer
    pub fn smp_abort(&mut self, ops: &dyn EngineOps, ctx: &SessionContext) {
        let Some(mut conn) = self.contexts.remove(ctx) else {
            return;
        };

        if conn.smp.phase() != SmpPhase::Idle {
            conn.smp.abort();
            conn.smp_question = None;
            if conn.msg_state == MessageState::Encrypted {
                self.send_control(ops, ctx, &mut conn, Tlv::SmpAbort);
            }
            ops.handle_smp_event(ctx, SmpEvent::Abort, 0, None);
        }

        self.contexts.insert(ctx.clone(), conn);
    }

    /// Periodic housekeeping: expire stale key exchanges and report the
    /// required poll interval
    pub fn message_poll(&mut self, ops: &dyn EngineOps) {
        let timeout = self.settings.ake_timeout;
        for (ctx, conn) in &mut self.contexts {
            if conn.ake.started_at().is_some_and(|started| started.elapsed() >= timeout) {
                log::debug!("Key exchange with {} timed out", ctx);
                conn.ake.reset();
            }
        }
        self.update_timer(ops);
    }

    fn update_timer(&mut self, ops: &dyn EngineOps) {
        let needed = self
            .contexts
            .values()
            .any(|conn| conn.msg_state == MessageState::Encrypted || conn.ake.in_progress());
        let interval = if needed {
            self.settings.poll_interval.as_secs().max(1)
        } else {
            0
        };

        if interval != self.timer_interval {
            self.timer_interval = interval;
            ops.timer_control(interval);
        }
    }

    fn smp_identities(
        &self,
        ctx: &SessionContext,
        conn: &ConnContext,
    ) -> Result<(FingerprintValue, FingerprintValue, [u8; cipher::SSID_SIZE])> {
        let keys = conn
            .keys
            .as_ref()
            .filter(|_| conn.msg_state == MessageState::Encrypted)
            .ok_or_else(|| EngineError::NotEncrypted {
                peer: ctx.peer_name.clone(),
            })?;
        let ours = self
            .private_key
            .as_ref()
            .ok_or_else(|| EngineError::NoPrivateKey {
                account: self.account.account_id.clone(),
            })?
            .fingerprint();

        Ok((
            ours,
            FingerprintValue::of_public_key(&keys.their_public_key),
            keys.ssid,
        ))
    }

    fn send_control(&self, ops: &dyn EngineOps, ctx: &SessionContext, conn: &mut ConnContext, tlv: Tlv) {
        match self.seal_data(ctx, conn, "", vec![tlv], FLAG_IGNORE_UNREADABLE) {
            Ok(encoded) => ops.inject_message(ctx, encoded),
            Err(err) => log::warn!("Failed to send control message to {}: {}", ctx, err),
        }
    }

    fn inject_envelope(&self, ops: &dyn EngineOps, ctx: &SessionContext, receiver_tag: u32, body: Body) {
        let envelope = Envelope {
            version: PROTOCOL_VERSION,
            sender_tag: self.instance_tag.value(),
            receiver_tag,
            body,
        };
        match wire::encode(&envelope) {
            Ok(encoded) => ops.inject_message(ctx, encoded),
            Err(err) => {
                log::error!("Failed to encode {} for {}: {}", envelope.body.name(), ctx, err);
                ops.handle_msg_event(ctx, MessageEvent::SetupError, None, Some(&err));
            }
        }
    }

    fn seal_data(
        &self,
        ctx: &SessionContext,
        conn: &mut ConnContext,
        text: &str,
        mut tlvs: Vec<Tlv>,
        flags: u8,
    ) -> Result<String> {
        let receiver_tag = conn.their_instance.map_or(0, InstanceTag::value);
        let sender_tag = self.instance_tag.value();
        let keys = conn.keys.as_mut().ok_or_else(|| EngineError::NotEncrypted {
            peer: ctx.peer_name.clone(),
        })?;

        if !text.is_empty() {
            tlvs.push(Tlv::Padding(vec![0u8; PADDING_BLOCK - text.len() % PADDING_BLOCK]));
        }
        let payload = wire::encode_payload(&DataPayload {
            text: text.to_string(),
            tlvs,
        })?;

        keys.send_counter += 1;
        let mut message = DataMessage {
            flags,
            counter: keys.send_counter,
            ciphertext: Vec::new(),
        };
        let aad = message.associated_data(sender_tag, receiver_tag);
        message.ciphertext = cipher::seal(&keys.send, message.counter, &aad, &payload)?;
        conn.last_sent = Some(Instant::now());

        wire::encode(&Envelope {
            version: PROTOCOL_VERSION,
            sender_tag,
            receiver_tag,
            body: Body::Data(message),
        })
    }
}

fn unreadable(
    ops: &dyn EngineOps,
    ctx: &SessionContext,
    ignore: bool,
    err: &OverlayError,
) -> Received {
    if ignore {
        return Received::Internal;
    }
    log::warn!("Unreadable message from {}: {}", ctx, err);
    ops.handle_msg_event(ctx, MessageEvent::RcvdMsgUnreadable, None, Some(err));
    ops.inject_message(ctx, wire::error_message(UNREADABLE_ERROR));
    Received::Error
}
