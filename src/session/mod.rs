//! Session layer.
//!
//! This module provides the per-conversation [`Session`], the [`Manager`]
//! owning per-account engine state, and the key generation worker.

pub mod conversation;
pub mod keygen;
pub mod manager;

pub use conversation::{
    DecryptResult, EncryptResult, PeerAuthentication, Session, SessionEvent,
    TrustFingerprintResult, TrustLevel,
};
pub use keygen::{KeyGenerationWorker, PendingPrivateKeyGeneration};
pub use manager::{AccountState, Deferred, Manager, ManagerEvent};
