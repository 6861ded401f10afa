//! Cryptographic primitives and identity management.
//!
//! This module provides the cryptography behind the overlay: long-term
//! identity keys and fingerprints, the authenticated key exchange, data
//! message encryption and the socialist millionaire protocol.

pub mod ake;
pub mod cipher;
pub mod identity;
pub mod smp;

pub use identity::*;
