//! # OTR Overlay
//!
//! An off-the-record encryption overlay for instant-messaging transports
//! that only carry plaintext. Two parties who both run the overlay get an
//! authenticated, end-to-end encrypted conversation and can confirm each
//! other's identity through the socialist millionaire protocol.
//!
//! ## Features
//!
//! - **Key exchange**: Signed Diffie-Hellman exchange bound to long-term
//!   Ed25519 identity keys
//! - **Encryption**: ChaCha20-Poly1305 data messages with replay protection
//! - **Peer authentication**: Shared-secret verification without revealing
//!   the secret
//! - **Policies**: Never, manual, opportunistic or always-encrypt behaviour
//! - **Durable state**: Per-account private keys, fingerprint tables and
//!   instance tags on disk
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use otr_overlay::{AccountIdentity, LoopbackTransport, Manager, OverlayConfig, Proxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Manager::new(&OverlayConfig::default());
//!     let account = AccountIdentity::new("alice", "alice@example.org", "jabber");
//!     let ((transport, _inbox), _peer_end) = LoopbackTransport::pair("alice", "bob");
//!
//!     let mut proxy = Proxy::new(manager, account, "bob@example.org", transport);
//!     proxy.connect_proxy()?;
//!     proxy.initialize()?;
//!     proxy.send_message("hello", 0)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: Identity keys, key exchange, data cipher and SMP
//! - [`engine`]: The protocol state machine, policies, wire format and
//!   durable storage
//! - [`session`]: Per-conversation sessions, the manager owning engine state
//!   and key generation
//! - [`proxy`]: Routing of a transport channel through a session
//! - [`transport`]: Message model and the transport seam
//! - [`utils`]: Configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod account;
pub mod crypto;
pub mod engine;
pub mod proxy;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use account::{AccountIdentity, SessionContext};
pub use crypto::{FingerprintValue, PrivateKey};
pub use engine::{Fingerprint, Policy};
pub use proxy::{Proxy, ProxyEvent};
pub use session::{Manager, ManagerEvent, Session, SessionEvent, TrustLevel};
pub use transport::{LoopbackTransport, Message, Transport};
pub use utils::{OverlayConfig, OverlayError, Result};

/// Maximum accepted message size in bytes (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Seconds of outgoing silence before a heartbeat is sent
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 60;

    /// Seconds an unfinished key exchange may stay idle
    pub const DEFAULT_AKE_TIMEOUT: u64 = 60;

    /// Seconds between engine housekeeping polls
    pub const DEFAULT_POLL_INTERVAL: u64 = 70;
}

#[cfg(test)]
pub(crate) mod test_utils {
    use crate::account::AccountIdentity;
    use crate::crypto::PrivateKey;
    use crate::engine::storage::{self, AccountPaths};
    use crate::engine::{EngineSettings, Policy};
    use crate::proxy::{Proxy, ProxyEvent};
    use crate::session::{Manager, Session};
    use crate::transport::loopback::LoopbackInbox;
    use crate::transport::{LoopbackTransport, Message};
    use std::path::Path;
    use tempfile::TempDir;

    pub(crate) fn account(name: &str) -> AccountIdentity {
        AccountIdentity::new(name, name, "test")
    }

    /// Manager whose account already has a key on disk
    pub(crate) fn keyed_manager(dir: &Path, account: &AccountIdentity, policy: Policy) -> Manager {
        let paths = AccountPaths::new(dir, &account.account_id);
        storage::write_private_key(&paths, account, &PrivateKey::generate()).unwrap();
        Manager::with_settings(dir, policy, EngineSettings::default())
    }

    pub(crate) struct SessionPeer {
        // Dropped before the manager and its directory
        pub session: Session,
        pub manager: Manager,
        _dir: TempDir,
    }

    fn session_peer(name: &str, peer: &str, policy: Policy) -> SessionPeer {
        let dir = TempDir::new().unwrap();
        let account = account(name);
        let manager = keyed_manager(dir.path(), &account, policy);
        let session = manager.create_session(&account, peer).unwrap();
        SessionPeer {
            session,
            manager,
            _dir: dir,
        }
    }

    pub(crate) fn session_pair(policy: Policy) -> (SessionPeer, SessionPeer) {
        (
            session_peer("alice", "bob", policy),
            session_peer("bob", "alice", policy),
        )
    }

    /// Carry queued protocol messages both ways until both sides are quiet
    pub(crate) fn exchange(a: &mut SessionPeer, b: &mut SessionPeer) {
        loop {
            let from_a = a.session.drain_outbound();
            let from_b = b.session.drain_outbound();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for message in from_a {
                b.session.decrypt(&mut Message::incoming(message.text));
            }
            for message in from_b {
                a.session.decrypt(&mut Message::incoming(message.text));
            }
        }
    }

    pub(crate) struct ProxyPeer {
        pub proxy: Proxy<LoopbackTransport>,
        pub inbox: LoopbackInbox,
        _dir: Option<TempDir>,
    }

    impl ProxyPeer {
        pub(crate) fn connect(
            manager: Manager,
            account: &AccountIdentity,
            peer: &str,
            transport: LoopbackTransport,
            inbox: LoopbackInbox,
        ) -> Self {
            let mut proxy = Proxy::new(manager, account.clone(), peer, transport);
            proxy.connect_proxy().unwrap();
            Self {
                proxy,
                inbox,
                _dir: None,
            }
        }
    }

    fn proxy_peer(
        name: &str,
        peer: &str,
        policy: Policy,
        with_key: bool,
        end: (LoopbackTransport, LoopbackInbox),
    ) -> ProxyPeer {
        let dir = TempDir::new().unwrap();
        let account = account(name);
        let manager = if with_key {
            keyed_manager(dir.path(), &account, policy)
        } else {
            Manager::with_settings(dir.path(), policy, EngineSettings::default())
        };
        let mut peer = ProxyPeer::connect(manager, &account, peer, end.0, end.1);
        peer._dir = Some(dir);
        peer
    }

    pub(crate) fn proxy_pair(policy: Policy, with_keys: bool) -> (ProxyPeer, ProxyPeer) {
        proxy_pair_keyed(policy, with_keys, with_keys)
    }

    /// Like [`proxy_pair`] with a separate choice of key for each side
    pub(crate) fn proxy_pair_keyed(policy: Policy, alice_key: bool, bob_key: bool) -> (ProxyPeer, ProxyPeer) {
        let (alice_end, bob_end) = LoopbackTransport::pair("alice", "bob");
        (
            proxy_peer("alice", "bob", policy, alice_key, alice_end),
            proxy_peer("bob", "alice", policy, bob_key, bob_end),
        )
    }

    /// Deliver what each side sent to the other until both inboxes are empty
    pub(crate) fn shuttle(a: &mut ProxyPeer, b: &mut ProxyPeer) {
        loop {
            let mut moved = false;
            for peer in [&mut *a, &mut *b] {
                while let Ok(message) = peer.inbox.try_recv() {
                    moved = true;
                    if peer.proxy.is_connected() {
                        peer.proxy.message_received(message).unwrap();
                    }
                }
            }
            if !moved {
                return;
            }
        }
    }

    /// Texts of the chat messages received since the last call
    pub(crate) fn received_texts(peer: &mut ProxyPeer) -> Vec<String> {
        peer.proxy
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                ProxyEvent::MessageReceived(message) => Some(message.text),
                _ => None,
            })
            .collect()
    }
}
