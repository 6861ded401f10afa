//! Routes a transport channel through a session.
//!
//! A [`Proxy`] sits between one conversation channel of the surrounding
//! messenger and the application. Outgoing chat goes through
//! [`Session::encrypt`] before reaching the [`Transport`]; incoming messages
//! go through [`Session::decrypt`] before reaching the application as
//! [`ProxyEvent::MessageReceived`].
//!
//! Messages are held in the manager's per-conversation queue while the
//! account's private key is being generated, and under the `always` policy
//! while the conversation is not yet private. Both holds release in order.

use crate::account::{AccountIdentity, SessionContext};
use crate::crypto::FingerprintValue;
use crate::engine::Policy;
use crate::session::{Deferred, EncryptResult, DecryptResult, Manager, Session, SessionEvent, TrustLevel};
use crate::transport::message::HEADER_FLAGS;
use crate::transport::{Message, Transport};
use crate::utils::{Result, SessionError};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Something the application should act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// Chat text from the peer, decrypted if it was encrypted
    MessageReceived(Message),
    /// A chat message left through the transport
    MessageSent {
        /// Transport token of the send
        token: String,
        /// Id of the message passed to `send_message`
        message_id: Uuid,
    },
    /// The transport confirmed delivery of a send
    MessageAcknowledged {
        /// Transport token of the send
        token: String,
    },
    /// Session-level event
    Session(SessionEvent),
}

/// Overlay for one conversation channel
#[derive(Debug)]
pub struct Proxy<T: Transport> {
    manager: Manager,
    account: AccountIdentity,
    context: SessionContext,
    transport: T,
    session: Option<Session>,
    unacknowledged: HashSet<String>,
    events: VecDeque<ProxyEvent>,
    start_pending: bool,
    auto_generate: bool,
}

impl<T: Transport> Proxy<T> {
    /// Create a disconnected proxy for `account`'s conversation with `peer`
    pub fn new(manager: Manager, account: AccountIdentity, peer: &str, transport: T) -> Self {
        let context = SessionContext::new(&account, peer);
        Self {
            manager,
            account,
            context,
            transport,
            session: None,
            unacknowledged: HashSet::new(),
            events: VecDeque::new(),
            start_pending: false,
            auto_generate: true,
        }
    }

    /// Whether `initialize` generates a missing private key
    #[must_use]
    pub fn with_auto_generate(mut self, auto_generate: bool) -> Self {
        self.auto_generate = auto_generate;
        self
    }

    /// Whether the proxy is attached
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// The live session, if connected
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// The manager owning the account's engine state
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// The local account
    pub fn account(&self) -> &AccountIdentity {
        &self.account
    }

    /// The conversation this proxy serves
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Attach to the channel and create the session
    ///
    /// # Errors
    ///
    /// Fails when the manager refuses to create the session
    pub fn connect_proxy(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        self.session = Some(self.manager.create_session(&self.account, &self.context.peer_name)?);
        log::info!("Proxy for {} connected", self.context);
        Ok(())
    }

    /// Detach from the channel, ending the private conversation first
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached
    pub fn disconnect_proxy(&mut self) -> Result<()> {
        let mut session = self.session.take().ok_or(SessionError::NotConnected)?;
        session.stop_session();
        let outbound = session.drain_outbound();
        let events = session.drain_events();
        drop(session);

        for message in outbound {
            if let Err(err) = self.transport.send(&message) {
                log::warn!("Failed to send disconnect to {}: {}", self.context.peer_name, err);
            }
        }
        self.events.extend(events.into_iter().map(ProxyEvent::Session));
        self.start_pending = false;
        self.unacknowledged.clear();
        log::info!("Proxy for {} disconnected", self.context);
        Ok(())
    }

    /// Generate a private key if needed, then offer a private conversation
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached, or when the offer cannot
    /// be sent
    pub fn initialize(&mut self) -> Result<()> {
        self.connected()?;
        if self.manager.policy() == Policy::Never {
            log::info!("Policy is never; not offering encryption to {}", self.context.peer_name);
            return Ok(());
        }

        let account_id = &self.account.account_id;
        if !self.manager.engine_state(&self.account)?.has_private_key()
            && self.auto_generate
            && !self.manager.is_generating_key(account_id)
        {
            self.manager.create_new_private_key(&self.account);
        }

        if self.manager.is_generating_key(account_id) {
            log::debug!("Offer to {} waits for key generation", self.context.peer_name);
            self.start_pending = true;
            return self.flush();
        }
        self.send_query()
    }

    /// End the private conversation but stay attached
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached
    pub fn stop(&mut self) -> Result<()> {
        self.connected()?.stop_session();
        self.flush()
    }

    /// Send chat text. Returns the transport token, or the message id while
    /// the message is held back.
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached, `EncryptionFailed` when
    /// the session refused the message, or a transport error
    pub fn send_message(&mut self, content: &str, flags: u32) -> Result<String> {
        self.connected()?;
        let message = Message::outgoing(content).with_header(HEADER_FLAGS, flags.to_string());
        self.route_outgoing(message)
    }

    /// Hand a message from the transport to the session
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached, or when a protocol reply
    /// cannot be sent
    pub fn message_received(&mut self, message: Message) -> Result<()> {
        self.connected()?;
        if self.manager.is_generating_key(&self.account.account_id) {
            self.manager.defer(&self.context, Deferred::Incoming(message));
            return Ok(());
        }
        self.deliver(message)
    }

    /// The transport confirmed delivery of `token`
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached
    pub fn message_acknowledged(&mut self, token: &str) -> Result<()> {
        self.connected()?;
        if self.unacknowledged.remove(token) {
            self.events.push_back(ProxyEvent::MessageAcknowledged {
                token: token.to_string(),
            });
        } else {
            log::debug!("Ignoring acknowledgement of unknown token {}", token);
        }
        Ok(())
    }

    /// Set the trust flag of one of the peer's fingerprints. Returns false if
    /// the fingerprint is unknown.
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached, or when the fingerprint
    /// table cannot be written
    pub fn trust_fingerprint(&mut self, value: &FingerprintValue, trust: bool) -> Result<bool> {
        self.connected()?;
        let updated = self
            .manager
            .trust_fingerprint(&self.account, &self.context.peer_name, value, trust)?;
        self.connected()?.process_pending();
        self.flush()?;
        Ok(updated)
    }

    /// Start peer authentication, with a question when one is given
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached, or when the conversation
    /// is not private
    pub fn start_peer_authentication(&mut self, question: Option<&str>, secret: &str) -> Result<()> {
        let session = self.connected()?;
        match question {
            Some(question) => session.init_smp_query(question, secret)?,
            None => session.init_smp_secret(secret)?,
        }
        self.flush()
    }

    /// Answer the peer's authentication request
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached, or when no request is
    /// pending
    pub fn respond_peer_authentication(&mut self, secret: &str) -> Result<()> {
        self.connected()?.respond_smp_authentication(secret)?;
        self.flush()
    }

    /// Abort peer authentication in progress
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached
    pub fn abort_peer_authentication(&mut self) -> Result<()> {
        self.connected()?.abort_smp_authentication()?;
        self.flush()
    }

    /// Process whatever the engine queued since the last call
    ///
    /// # Errors
    ///
    /// Fails with `NotConnected` when not attached, or when a queued message
    /// cannot be sent
    pub fn pump(&mut self) -> Result<()> {
        self.connected()?.process_pending();
        self.flush()
    }

    /// Events raised since the last call, in order
    pub fn take_events(&mut self) -> Vec<ProxyEvent> {
        self.events.drain(..).collect()
    }

    /// Wait for the next event. Returns `None` once disconnected.
    pub async fn next_event(&mut self) -> Option<ProxyEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            let session = self.session.as_mut()?;
            if !session.wait_signal().await {
                return None;
            }
            if let Err(err) = self.flush() {
                log::warn!("Failed to flush {}: {}", self.context, err);
            }
        }
    }

    fn connected(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| SessionError::NotConnected.into())
    }

    fn send_query(&mut self) -> Result<()> {
        let query = self.connected()?.start_session();
        self.transport.send(&query)?;
        self.flush()
    }

    fn route_outgoing(&mut self, message: Message) -> Result<String> {
        let id = message.id.to_string();
        if self.manager.is_generating_key(&self.account.account_id) {
            self.manager.defer(&self.context, Deferred::Outgoing(message));
            return Ok(id);
        }

        let session = self.session.as_mut().ok_or(SessionError::NotConnected)?;
        if self.manager.policy() == Policy::Always
            && session.trust_level() == TrustLevel::NotPrivate
            && !self.manager.key_generation_failed(&self.account.account_id)
        {
            self.manager
                .defer(&self.context, Deferred::Outgoing(message.clone()));
            // The session refuses the text; the engine offers a key exchange
            // unless one is already under way
            let mut refused = message;
            session.encrypt(&mut refused);
            if let Err(err) = self.flush() {
                log::warn!("Message {} held, but flushing {} failed: {}", id, self.context, err);
            }
            return Ok(id);
        }

        self.transmit(message)
    }

    fn transmit(&mut self, mut message: Message) -> Result<String> {
        let session = self.session.as_mut().ok_or(SessionError::NotConnected)?;
        match session.encrypt(&mut message) {
            EncryptResult::Unchanged | EncryptResult::Changed => {
                let token = self.transport.send(&message)?;
                self.unacknowledged.insert(token.clone());
                self.events.push_back(ProxyEvent::MessageSent {
                    token: token.clone(),
                    message_id: message.id,
                });
                self.flush()?;
                Ok(token)
            }
            EncryptResult::Error => {
                self.flush()?;
                Err(SessionError::EncryptionFailed {
                    peer: self.context.peer_name.clone(),
                }
                .into())
            }
        }
    }

    fn deliver(&mut self, mut message: Message) -> Result<()> {
        let session = self.session.as_mut().ok_or(SessionError::NotConnected)?;
        match session.decrypt(&mut message) {
            DecryptResult::Unchanged | DecryptResult::Changed => {
                self.events.push_back(ProxyEvent::MessageReceived(message));
            }
            DecryptResult::Otr | DecryptResult::Error => {}
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        loop {
            let Some(session) = self.session.as_mut() else {
                return Ok(());
            };
            let outbound = session.drain_outbound();
            let events = session.drain_events();
            if outbound.is_empty() && events.is_empty() {
                return Ok(());
            }

            for message in outbound {
                self.transport.send(&message)?;
            }

            let mut release = false;
            for event in events {
                match &event {
                    SessionEvent::KeyGenerationFinished { .. } => release = true,
                    SessionEvent::TrustLevelChanged { level } if level.is_private() => release = true,
                    _ => {}
                }
                self.events.push_back(ProxyEvent::Session(event));
            }
            if release {
                self.release_deferred()?;
            }
        }
    }

    fn release_deferred(&mut self) -> Result<()> {
        if self.manager.is_generating_key(&self.account.account_id) {
            return Ok(());
        }
        if std::mem::take(&mut self.start_pending) {
            if self.manager.key_generation_failed(&self.account.account_id) {
                log::warn!("No private key for {}; not offering encryption", self.account);
            } else {
                self.send_query()?;
            }
        }

        let queue = self.manager.take_deferred(&self.context);
        if !queue.is_empty() {
            log::debug!("Releasing {} held messages of {}", queue.len(), self.context);
        }
        for deferred in queue {
            match deferred {
                Deferred::Incoming(message) => self.deliver(message)?,
                Deferred::Outgoing(message) => {
                    if let Err(err) = self.route_outgoing(message) {
                        log::warn!("Held message to {} not sent: {}", self.context.peer_name, err);
                    }
                }
            }
        }
        Ok(())
    }
}

impl<T: Transport> Drop for Proxy<T> {
    fn drop(&mut self) {
        // Tell the peer before the session goes away with its outbound queue
        if self.session.is_some() {
            if let Err(err) = self.disconnect_proxy() {
                log::warn!("Failed to disconnect {} on drop: {}", self.context, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MessageEvent;
    use crate::session::ManagerEvent;
    use crate::test_utils::{
        account, keyed_manager, proxy_pair, proxy_pair_keyed, received_texts, shuttle, ProxyPeer,
    };
    use crate::transport::LoopbackTransport;
    use crate::utils::OverlayError;
    use std::time::Duration;
    use tempfile::TempDir;

    fn private_pair(policy: Policy) -> (ProxyPeer, ProxyPeer) {
        let (mut alice, mut bob) = proxy_pair(policy, true);
        alice.proxy.initialize().unwrap();
        shuttle(&mut alice, &mut bob);
        (alice, bob)
    }

    fn trust(peer: &ProxyPeer) -> TrustLevel {
        peer.proxy.session().unwrap().trust_level()
    }

    #[test]
    fn test_calls_fail_while_disconnected() {
        let (mut alice, _bob) = proxy_pair(Policy::Opportunistic, true);
        alice.proxy.disconnect_proxy().unwrap();

        let not_connected = |result: Result<()>| {
            matches!(result, Err(OverlayError::Session(SessionError::NotConnected)))
        };
        assert!(not_connected(alice.proxy.send_message("hi", 0).map(|_| ())));
        assert!(not_connected(alice.proxy.message_received(Message::incoming("hi"))));
        assert!(not_connected(alice.proxy.message_acknowledged("t")));
        assert!(not_connected(alice.proxy.initialize()));
        assert!(not_connected(alice.proxy.stop()));
        assert!(not_connected(alice.proxy.respond_peer_authentication("x")));
        assert!(not_connected(alice.proxy.disconnect_proxy()));
    }

    #[test]
    fn test_private_round_trip() {
        let (mut alice, mut bob) = private_pair(Policy::Opportunistic);
        assert_eq!(trust(&alice), TrustLevel::Unverified);
        assert_eq!(trust(&bob), TrustLevel::Unverified);

        let token = alice.proxy.send_message("hello bob", 0).unwrap();
        shuttle(&mut alice, &mut bob);
        assert_eq!(received_texts(&mut bob), vec!["hello bob".to_string()]);

        alice.proxy.message_acknowledged(&token).unwrap();
        assert!(alice
            .proxy
            .take_events()
            .contains(&ProxyEvent::MessageAcknowledged { token }));
    }

    #[test]
    fn test_opportunistic_whitespace_start() {
        let (mut alice, mut bob) = proxy_pair(Policy::Opportunistic, true);

        alice.proxy.send_message("plain hello", 0).unwrap();
        shuttle(&mut alice, &mut bob);

        assert_eq!(received_texts(&mut bob), vec!["plain hello".to_string()]);
        assert_eq!(trust(&alice), TrustLevel::Unverified);
        assert_eq!(trust(&bob), TrustLevel::Unverified);
    }

    #[test]
    fn test_manual_policy_waits_for_request() {
        let (mut alice, mut bob) = proxy_pair(Policy::Manual, true);

        alice.proxy.send_message("hi", 0).unwrap();
        shuttle(&mut alice, &mut bob);
        assert_eq!(received_texts(&mut bob), vec!["hi".to_string()]);
        assert_eq!(trust(&bob), TrustLevel::NotPrivate);

        bob.proxy.initialize().unwrap();
        shuttle(&mut alice, &mut bob);
        assert_eq!(trust(&alice), TrustLevel::Unverified);
    }

    #[test]
    fn test_always_policy_holds_until_private() {
        let (mut alice, mut bob) = proxy_pair(Policy::Always, true);

        alice.proxy.send_message("first", 0).unwrap();
        alice.proxy.send_message("second", 0).unwrap();
        assert!(alice.proxy.take_events().iter().any(|event| matches!(
            event,
            ProxyEvent::Session(SessionEvent::Notice(notice))
                if notice.event.as_deref() == Some(MessageEvent::EncryptionRequired.code())
        )));

        shuttle(&mut alice, &mut bob);
        assert_eq!(trust(&alice), TrustLevel::Unverified);
        assert_eq!(
            received_texts(&mut bob),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn test_always_policy_offers_again_after_lost_query() {
        let (mut alice, mut bob) = proxy_pair(Policy::Always, true);

        alice.proxy.send_message("first", 0).unwrap();
        // The offer never reaches bob
        while bob.inbox.try_recv().is_ok() {}

        alice.proxy.send_message("second", 0).unwrap();
        shuttle(&mut alice, &mut bob);
        assert_eq!(trust(&alice), TrustLevel::Unverified);
        assert_eq!(
            received_texts(&mut bob),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn test_held_message_survives_transport_failure() {
        let dir = TempDir::new().unwrap();
        let alice_account = account("alice");
        let manager = keyed_manager(dir.path(), &alice_account, Policy::Always);
        let ((alice_end, alice_inbox), bob_end) = LoopbackTransport::pair("alice", "bob");
        drop(bob_end);
        let mut alice = ProxyPeer::connect(manager.clone(), &alice_account, "bob", alice_end, alice_inbox);

        let id = alice.proxy.send_message("held", 0).unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert!(manager.has_deferred(alice.proxy.context()));
    }

    #[test]
    fn test_smp_through_proxies() {
        let (mut alice, mut bob) = private_pair(Policy::Opportunistic);

        alice
            .proxy
            .start_peer_authentication(Some("pet's name?"), "rex")
            .unwrap();
        shuttle(&mut alice, &mut bob);
        assert!(bob.proxy.take_events().iter().any(|event| matches!(
            event,
            ProxyEvent::Session(SessionEvent::PeerAuthentication(
                crate::session::PeerAuthentication::Requested { question: Some(q) }
            )) if q == "pet's name?"
        )));

        bob.proxy.respond_peer_authentication("rex").unwrap();
        shuttle(&mut alice, &mut bob);
        assert_eq!(trust(&alice), TrustLevel::Verified);
        assert_eq!(trust(&bob), TrustLevel::Verified);
    }

    #[test]
    fn test_abort_peer_authentication() {
        let (mut alice, mut bob) = private_pair(Policy::Opportunistic);

        alice.proxy.start_peer_authentication(None, "rex").unwrap();
        shuttle(&mut alice, &mut bob);
        bob.proxy.abort_peer_authentication().unwrap();
        shuttle(&mut alice, &mut bob);

        assert!(alice.proxy.take_events().iter().any(|event| matches!(
            event,
            ProxyEvent::Session(SessionEvent::PeerAuthentication(
                crate::session::PeerAuthentication::Aborted
            ))
        )));
        assert_eq!(trust(&alice), TrustLevel::Unverified);
    }

    #[test]
    fn test_trust_fingerprint_through_proxy() {
        let (mut alice, _bob) = private_pair(Policy::Opportunistic);
        let fingerprint = alice.proxy.session().unwrap().remote_fingerprint().unwrap();

        assert!(alice.proxy.trust_fingerprint(&fingerprint.value, true).unwrap());
        assert_eq!(trust(&alice), TrustLevel::Verified);
        assert!(!alice
            .proxy
            .trust_fingerprint(&FingerprintValue::from_bytes([1u8; 20]), true)
            .unwrap());
    }

    #[test]
    fn test_disconnect_finishes_peer() {
        let (mut alice, mut bob) = private_pair(Policy::Opportunistic);

        alice.proxy.disconnect_proxy().unwrap();
        shuttle(&mut alice, &mut bob);
        assert_eq!(trust(&bob), TrustLevel::Finished);

        assert!(matches!(
            bob.proxy.send_message("hello?", 0),
            Err(OverlayError::Session(SessionError::EncryptionFailed { .. }))
        ));
    }

    #[test]
    fn test_dropped_proxy_finishes_peer() {
        let (alice, mut bob) = private_pair(Policy::Opportunistic);
        assert_eq!(trust(&bob), TrustLevel::Unverified);

        let proxy = alice.proxy;
        drop(proxy);
        while let Ok(message) = bob.inbox.try_recv() {
            bob.proxy.message_received(message).unwrap();
        }
        assert_eq!(trust(&bob), TrustLevel::Finished);
    }

    #[test]
    fn test_concurrent_peers_do_not_mix() {
        let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
        let alice_account = account("alice");
        let alice_manager = keyed_manager(dirs[0].path(), &alice_account, Policy::Opportunistic);

        let ((a_bob_end, a_bob_inbox), (bob_end, bob_inbox)) = LoopbackTransport::pair("alice", "bob");
        let ((a_john_end, a_john_inbox), (john_end, john_inbox)) = LoopbackTransport::pair("alice", "john");

        let mut alice_bob = ProxyPeer::connect(alice_manager.clone(), &alice_account, "bob", a_bob_end, a_bob_inbox);
        let mut alice_john = ProxyPeer::connect(alice_manager.clone(), &alice_account, "john", a_john_end, a_john_inbox);

        let bob_account = account("bob");
        let bob_manager = keyed_manager(dirs[1].path(), &bob_account, Policy::Opportunistic);
        let mut bob = ProxyPeer::connect(bob_manager, &bob_account, "alice", bob_end, bob_inbox);

        let john_account = account("john");
        let john_manager = keyed_manager(dirs[2].path(), &john_account, Policy::Opportunistic);
        let mut john = ProxyPeer::connect(john_manager, &john_account, "alice", john_end, john_inbox);

        alice_bob.proxy.initialize().unwrap();
        alice_john.proxy.initialize().unwrap();
        shuttle(&mut alice_bob, &mut bob);
        shuttle(&mut alice_john, &mut john);

        let bob_fp = alice_bob.proxy.session().unwrap().remote_fingerprint().unwrap();
        let john_fp = alice_john.proxy.session().unwrap().remote_fingerprint().unwrap();
        assert_ne!(bob_fp.value, john_fp.value);

        alice_bob.proxy.trust_fingerprint(&bob_fp.value, true).unwrap();
        assert_eq!(trust(&alice_bob), TrustLevel::Verified);
        assert_eq!(trust(&alice_john), TrustLevel::Unverified);

        alice_bob.proxy.send_message("for bob", 0).unwrap();
        alice_john.proxy.send_message("for john", 0).unwrap();
        shuttle(&mut alice_bob, &mut bob);
        shuttle(&mut alice_john, &mut john);
        assert_eq!(received_texts(&mut bob), vec!["for bob".to_string()]);
        assert_eq!(received_texts(&mut john), vec!["for john".to_string()]);

        let known = alice_manager.known_fingerprints(&alice_account).unwrap();
        assert_eq!(known.len(), 2);
        assert!(known.iter().all(|fp| fp.in_use));
        assert_eq!(known.iter().filter(|fp| fp.trusted).count(), 1);
    }

    #[tokio::test]
    async fn test_messages_wait_for_key_generation() {
        let (mut alice, mut bob) = proxy_pair(Policy::Opportunistic, false);

        alice.proxy.initialize().unwrap();
        alice.proxy.send_message("queued", 0).unwrap();
        assert!(bob.inbox.try_recv().is_err());

        let finished = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match alice.proxy.next_event().await {
                    Some(ProxyEvent::Session(SessionEvent::KeyGenerationFinished { error })) => {
                        break error
                    }
                    Some(_) => {}
                    None => panic!("session closed"),
                }
            }
        })
        .await
        .unwrap();
        assert!(!finished);

        // Bob has no key either; his side defers until his own generation
        // finishes
        shuttle(&mut alice, &mut bob);
        let _ = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                if let Some(ProxyEvent::Session(SessionEvent::KeyGenerationFinished { .. })) =
                    bob.proxy.next_event().await
                {
                    break;
                }
            }
        })
        .await
        .unwrap();
        shuttle(&mut alice, &mut bob);

        assert_eq!(received_texts(&mut bob), vec!["queued".to_string()]);
        assert_eq!(trust(&alice), TrustLevel::Unverified);
        assert_eq!(trust(&bob), TrustLevel::Unverified);
    }

    #[tokio::test]
    async fn test_failed_key_generation_releases_held_messages_once() {
        let (mut alice, mut bob) = proxy_pair_keyed(Policy::Opportunistic, true, false);
        let bob_manager = bob.proxy.manager().clone();
        let key_file = bob_manager
            .engine_state(bob.proxy.account())
            .unwrap()
            .paths()
            .private_key();
        std::fs::create_dir_all(key_file.join("occupied")).unwrap();
        let mut manager_events = bob_manager.subscribe();

        alice.proxy.initialize().unwrap();
        alice.proxy.send_message("hello", 0).unwrap();
        shuttle(&mut alice, &mut bob);
        assert!(bob_manager.is_generating_key("bob"));

        let failed = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match bob.proxy.next_event().await {
                    Some(ProxyEvent::Session(SessionEvent::KeyGenerationFinished { error })) => {
                        break error
                    }
                    Some(_) => {}
                    None => panic!("session closed"),
                }
            }
        })
        .await
        .unwrap();
        assert!(failed);
        assert!(bob_manager.key_generation_failed("bob"));

        // The held chat text comes through as plaintext
        assert_eq!(received_texts(&mut bob), vec!["hello".to_string()]);

        // Further traffic does not start generation again
        shuttle(&mut alice, &mut bob);
        alice.proxy.initialize().unwrap();
        shuttle(&mut alice, &mut bob);
        tokio::time::sleep(Duration::from_millis(100)).await;
        bob.proxy.pump().unwrap();

        let mut started = 0;
        let mut finished = Vec::new();
        while let Ok(event) = manager_events.try_recv() {
            match event {
                ManagerEvent::KeyGenerationStarted { .. } => started += 1,
                ManagerEvent::KeyGenerationFinished { error, .. } => finished.push(error),
                ManagerEvent::NewFingerprint { .. } => {}
            }
        }
        assert_eq!(started, 1);
        assert_eq!(finished, vec![true]);
        assert!(!bob_manager.is_generating_key("bob"));
        assert_eq!(trust(&bob), TrustLevel::NotPrivate);
    }
}
