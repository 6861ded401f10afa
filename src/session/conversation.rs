//! The per-conversation session.
//!
//! A [`Session`] binds one local account to one peer. It runs every engine
//! call through its [`Manager`], collects what the engine's callbacks queued
//! for it (messages to inject, trust changes, SMP progress, notices) and
//! tracks the conversation's [`TrustLevel`].
//!
//! Everything here is synchronous and takes `&mut self`, so per-peer
//! processing is sequential by construction.

use crate::account::{AccountIdentity, SessionContext};
use crate::crypto::smp::SmpPhase;
use crate::engine::wire::QUERY_MESSAGE;
use crate::engine::{
    ContextView, EngineOps, EngineState, Fingerprint, InstanceTag, MessageEvent, MessageState,
    Outgoing, Received, SmpEvent,
};
use crate::session::manager::{Deferred, EngineSignal, Manager};
use crate::transport::message::{HEADER_ERROR, HEADER_ORIGINAL_TEXT};
use crate::transport::Message;
use crate::utils::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;

/// Outcome of [`Session::encrypt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptResult {
    /// Plaintext allowed; a whitespace tag may have been appended
    Unchanged,
    /// Text replaced with ciphertext
    Changed,
    /// The engine refused; do not send
    Error,
}

/// Outcome of [`Session::decrypt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptResult {
    /// Ordinary plaintext
    Unchanged,
    /// Text replaced with decrypted plaintext
    Changed,
    /// Protocol message, consumed; do not display
    Otr,
    /// Not deliverable; a notice event explains why
    Error,
}

/// Outcome of [`Session::trust_fingerprint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustFingerprintResult {
    /// Trust flag updated
    Ok,
    /// No peer key has been seen in this conversation
    NoSuchFingerprint,
    /// The active key is not in the fingerprint store
    InvalidFingerprint,
}

/// How private a conversation currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Plaintext
    NotPrivate,
    /// Encrypted, peer identity not confirmed
    Unverified,
    /// Encrypted, peer identity confirmed
    Verified,
    /// The peer ended the private conversation
    Finished,
}

impl TrustLevel {
    /// Derive the trust level from an engine context snapshot
    pub fn from_view(view: &ContextView) -> Self {
        match view.msg_state {
            MessageState::Plaintext => Self::NotPrivate,
            MessageState::Encrypted if view.trusted => Self::Verified,
            MessageState::Encrypted => Self::Unverified,
            MessageState::Finished => Self::Finished,
        }
    }

    /// Encrypted, verified or not
    pub fn is_private(self) -> bool {
        matches!(self, Self::Unverified | Self::Verified)
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotPrivate => "not private",
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Progress of peer authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAuthentication {
    /// The peer asked us to authenticate; answer with
    /// [`Session::respond_smp_authentication`]
    Requested {
        /// The peer's question, if any
        question: Option<String>,
    },
    /// The exchange advanced
    InProgress {
        /// Completion percentage
        progress: u8,
    },
    /// The exchange completed
    Concluded {
        /// True when both sides used the same secret
        authenticated: bool,
    },
    /// Either side aborted
    Aborted,
    /// The exchange failed internally or ran out of order
    Error,
    /// The peer sent an invalid proof
    Cheated,
}

/// Something the owner of a session should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The trust level changed
    TrustLevelChanged {
        /// New level
        level: TrustLevel,
    },
    /// The private conversation was re-keyed with the same peer key
    SessionRefreshed,
    /// Peer authentication progress
    PeerAuthentication(PeerAuthentication),
    /// A peer key was seen for the first time
    NewFingerprint {
        /// Fingerprint of the key
        fingerprint: crate::crypto::FingerprintValue,
    },
    /// A protocol notice for the user
    Notice(Message),
    /// Key generation for the account started
    KeyGenerationStarted,
    /// Key generation for the account completed
    KeyGenerationFinished {
        /// True when generation failed
        error: bool,
    },
}

/// One conversation between a local account and a peer
#[derive(Debug)]
pub struct Session {
    manager: Manager,
    account: AccountIdentity,
    context: SessionContext,
    trust_level: TrustLevel,
    signals: mpsc::UnboundedReceiver<EngineSignal>,
    outbound: VecDeque<Message>,
    events: VecDeque<SessionEvent>,
}

impl Session {
    pub(crate) fn new(
        manager: Manager,
        account: AccountIdentity,
        context: SessionContext,
        signals: mpsc::UnboundedReceiver<EngineSignal>,
    ) -> Self {
        Self {
            manager,
            account,
            context,
            trust_level: TrustLevel::NotPrivate,
            signals,
            outbound: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// The conversation this session is bound to
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// The local account
    pub fn account(&self) -> &AccountIdentity {
        &self.account
    }

    /// Current trust level
    pub fn trust_level(&self) -> TrustLevel {
        self.trust_level
    }

    /// Our instance tag
    ///
    /// # Errors
    ///
    /// Fails when the account cannot be loaded
    pub fn instance_tag(&self) -> Result<InstanceTag> {
        self.manager.instance_tag(&self.account)
    }

    /// The peer's instance tag, once a key exchange revealed it
    pub fn peer_instance_tag(&self) -> Option<InstanceTag> {
        self.view().ok()?.their_instance
    }

    /// The fingerprint of the peer key used by the current conversation
    pub fn remote_fingerprint(&self) -> Option<Fingerprint> {
        let value = self.view().ok()?.fingerprint?;
        self.manager
            .known_fingerprints(&self.account)
            .ok()?
            .into_iter()
            .find(|fingerprint| fingerprint.owner_peer == self.context.peer_name && fingerprint.value == value)
    }

    /// SMP progress
    pub fn smp_state(&self) -> SmpPhase {
        self.view().map_or(SmpPhase::Idle, |view| view.smp)
    }

    /// The message asking the peer to start a private conversation
    pub fn start_session(&self) -> Message {
        log::info!("Offering a private conversation on {}", self.context);
        Message::outgoing(QUERY_MESSAGE)
    }

    /// End the private conversation. The peer is told and moves to
    /// finished; we drop to not private. Aborts SMP in progress.
    pub fn stop_session(&mut self) {
        let stopped = self.engine(|engine, ops, ctx| {
            engine.smp_abort(ops, ctx);
            engine.disconnect(ops, ctx);
        });
        if let Err(err) = stopped {
            log::error!("Failed to stop {}: {}", self.context, err);
        }
    }

    /// Process an outgoing message in place
    pub fn encrypt(&mut self, message: &mut Message) -> EncryptResult {
        let text = message.text.clone();
        match self
            .engine(|engine, ops, ctx| engine.send(ops, ctx, &text))
            .and_then(std::convert::identity)
        {
            Ok(Outgoing::Plaintext(text)) => {
                message.text = text;
                EncryptResult::Unchanged
            }
            Ok(Outgoing::Encrypted(text)) => {
                message.text = text;
                message.encrypted = true;
                EncryptResult::Changed
            }
            Err(err) => {
                log::debug!("Not sending message {} on {}: {}", message.id, self.context, err);
                EncryptResult::Error
            }
        }
    }

    /// Process an incoming message in place
    pub fn decrypt(&mut self, message: &mut Message) -> DecryptResult {
        let text = message.text.clone();
        match self.engine(|engine, ops, ctx| engine.receive(ops, ctx, &text)) {
            Ok(Received::Plaintext(text)) => {
                message.text = text;
                DecryptResult::Unchanged
            }
            Ok(Received::Decrypted(text)) => {
                message.text = text;
                message.encrypted = true;
                DecryptResult::Changed
            }
            Ok(Received::Internal) => DecryptResult::Otr,
            Ok(Received::NeedsPrivateKey) => {
                self.manager
                    .defer(&self.context, Deferred::Incoming(message.clone()));
                DecryptResult::Otr
            }
            Ok(Received::Error) => DecryptResult::Error,
            Err(err) => {
                log::error!("Failed to process message on {}: {}", self.context, err);
                DecryptResult::Error
            }
        }
    }

    /// Start authentication with a question the peer must answer
    ///
    /// # Errors
    ///
    /// Fails when the conversation is not private
    pub fn init_smp_query(&mut self, question: &str, secret: &str) -> Result<()> {
        self.engine(|engine, ops, ctx| engine.smp_start(ops, ctx, Some(question), secret.as_bytes()))?
    }

    /// Start authentication with a secret shared out of band
    ///
    /// # Errors
    ///
    /// Fails when the conversation is not private
    pub fn init_smp_secret(&mut self, secret: &str) -> Result<()> {
        self.engine(|engine, ops, ctx| engine.smp_start(ops, ctx, None, secret.as_bytes()))?
    }

    /// Answer the peer's authentication request
    ///
    /// # Errors
    ///
    /// Fails when no request is pending
    pub fn respond_smp_authentication(&mut self, secret: &str) -> Result<()> {
        self.engine(|engine, ops, ctx| engine.smp_respond(ops, ctx, secret.as_bytes()))?
    }

    /// Abort authentication in progress
    ///
    /// # Errors
    ///
    /// Fails when the account cannot be loaded
    pub fn abort_smp_authentication(&mut self) -> Result<()> {
        self.engine(|engine, ops, ctx| engine.smp_abort(ops, ctx))
    }

    /// Set the trust flag of the peer key used by this conversation
    pub fn trust_fingerprint(&mut self, trust: bool) -> TrustFingerprintResult {
        let Some(value) = self.view().ok().and_then(|view| view.fingerprint) else {
            return TrustFingerprintResult::NoSuchFingerprint;
        };

        let result = match self
            .manager
            .trust_fingerprint(&self.account, &self.context.peer_name, &value, trust)
        {
            Ok(true) => TrustFingerprintResult::Ok,
            Ok(false) => TrustFingerprintResult::InvalidFingerprint,
            Err(err) => {
                log::error!("Failed to update trust on {}: {}", self.context, err);
                TrustFingerprintResult::InvalidFingerprint
            }
        };
        self.process_pending();
        result
    }

    /// Handle everything the engine queued for this session
    pub fn process_pending(&mut self) {
        while let Ok(signal) = self.signals.try_recv() {
            self.handle_signal(signal);
        }
        self.refresh_trust_level();
    }

    /// Wait for the next engine signal and handle it along with anything
    /// queued behind it. Returns false when the session was unregistered.
    pub async fn wait_signal(&mut self) -> bool {
        match self.signals.recv().await {
            Some(signal) => {
                self.handle_signal(signal);
                self.process_pending();
                true
            }
            None => false,
        }
    }

    /// Messages the engine wants sent to the peer, in order
    pub fn drain_outbound(&mut self) -> Vec<Message> {
        self.outbound.drain(..).collect()
    }

    /// Events raised since the last call, in order
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    fn engine<R>(
        &mut self,
        f: impl FnOnce(&mut EngineState, &dyn EngineOps, &SessionContext) -> R,
    ) -> Result<R> {
        let context = &self.context;
        let result = self
            .manager
            .with_engine(&self.account, |engine, ops| f(engine, ops, context));
        self.process_pending();
        result
    }

    fn view(&self) -> Result<ContextView> {
        self.manager.context_view(&self.account, &self.context)
    }

    fn refresh_trust_level(&mut self) {
        let level = match self.view() {
            Ok(view) => TrustLevel::from_view(&view),
            Err(err) => {
                log::error!("Cannot read state of {}: {}", self.context, err);
                return;
            }
        };

        if level != self.trust_level {
            log::info!("{} is now {}", self.context, level);
            self.trust_level = level;
            self.events.push_back(SessionEvent::TrustLevelChanged { level });
        }
    }

    fn handle_signal(&mut self, signal: EngineSignal) {
        match signal {
            EngineSignal::Inject(text) => self.outbound.push_back(Message::outgoing(text)),
            EngineSignal::GoneSecure => log::debug!("{} went secure", self.context),
            EngineSignal::GoneInsecure => log::debug!("{} went insecure", self.context),
            EngineSignal::StillSecure => self.events.push_back(SessionEvent::SessionRefreshed),
            EngineSignal::NewFingerprint(fingerprint) => {
                self.events.push_back(SessionEvent::NewFingerprint { fingerprint });
            }
            EngineSignal::Smp {
                event,
                progress,
                question,
            } => {
                let progress_event = match event {
                    SmpEvent::AskForAnswer | SmpEvent::AskForSecret => {
                        PeerAuthentication::Requested { question }
                    }
                    SmpEvent::InProgress => PeerAuthentication::InProgress { progress },
                    SmpEvent::Success => PeerAuthentication::Concluded { authenticated: true },
                    SmpEvent::Failure => PeerAuthentication::Concluded {
                        authenticated: false,
                    },
                    SmpEvent::Abort => PeerAuthentication::Aborted,
                    SmpEvent::Cheated => PeerAuthentication::Cheated,
                    SmpEvent::Error => PeerAuthentication::Error,
                };
                self.events
                    .push_back(SessionEvent::PeerAuthentication(progress_event));
            }
            EngineSignal::Notice {
                event,
                message,
                error,
            } => {
                let notice = self.notice(event, message, error);
                self.events.push_back(SessionEvent::Notice(notice));
            }
            EngineSignal::TrustChanged => {}
            EngineSignal::KeyGenerationStarted => {
                self.events.push_back(SessionEvent::KeyGenerationStarted);
            }
            EngineSignal::KeyGenerationFinished { error } => {
                self.events
                    .push_back(SessionEvent::KeyGenerationFinished { error });
            }
        }
    }

    fn notice(&self, event: MessageEvent, message: Option<String>, error: Option<String>) -> Message {
        let description = event.describe(&self.context.peer_name);
        if event.is_log_only() {
            log::debug!("{}: {}", self.context, description);
        } else {
            log::info!("{}: {}", self.context, description);
        }

        let mut notice = Message::notice(event.code(), description);
        if let Some(original) = message {
            notice = notice.with_header(HEADER_ORIGINAL_TEXT, original);
        }
        if let Some(error) = error {
            notice = notice.with_header(HEADER_ERROR, error);
        }
        notice
    }
}

/// Dropping a private session ends it in the engine, but the disconnect
/// message it queues is discarded with the session. To let the peer know, end
/// the session with [`Session::stop_session`] and send what
/// [`Session::drain_outbound`] returns first; [`crate::Proxy`] does this when
/// it is disconnected or dropped.
impl Drop for Session {
    fn drop(&mut self) {
        if self.trust_level != TrustLevel::NotPrivate {
            self.stop_session();
        }
        self.manager.close_session(&self.context);
    }
}
