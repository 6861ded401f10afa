//! Key derivation and authenticated encryption for data messages.
//!
//! All symmetric keys of a conversation are derived with HKDF-SHA256 from the
//! Diffie-Hellman output of the key exchange. Messages are sealed with
//! ChaCha20-Poly1305; the nonce is the message counter, so a key/counter pair
//! is never reused.

use crate::utils::{CryptoError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;

/// Size of symmetric encryption keys
pub const KEY_SIZE: usize = 32;

/// Size of the secure session id
pub const SSID_SIZE: usize = 8;

/// HKDF info strings, one per derived secret
const SSID_INFO: &[u8] = b"otr-overlay-ssid";
const COMMITTER_AKE_INFO: &[u8] = b"otr-overlay-ake-committer";
const RESPONDER_AKE_INFO: &[u8] = b"otr-overlay-ake-responder";
const COMMITTER_DATA_INFO: &[u8] = b"otr-overlay-data-committer";
const RESPONDER_DATA_INFO: &[u8] = b"otr-overlay-data-responder";

/// Every secret derived from one key exchange
#[derive(Clone)]
pub struct SessionSecrets {
    /// Secure session id, shown to users and bound into SMP
    pub ssid: [u8; SSID_SIZE],
    /// Seals the identity proof sent by the committing party
    pub committer_ake_key: [u8; KEY_SIZE],
    /// Seals the identity proof sent by the responding party
    pub responder_ake_key: [u8; KEY_SIZE],
    /// Encrypts data from the committing party
    pub committer_data_key: [u8; KEY_SIZE],
    /// Encrypts data from the responding party
    pub responder_data_key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for SessionSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSecrets")
            .field("ssid", &hex::encode(self.ssid))
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

impl SessionSecrets {
    /// Derive all conversation secrets from a Diffie-Hellman output
    pub fn derive(shared_secret: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret);

        let mut ssid = [0u8; SSID_SIZE];
        expand(&hkdf, SSID_INFO, &mut ssid)?;

        let mut secrets = Self {
            ssid,
            committer_ake_key: [0u8; KEY_SIZE],
            responder_ake_key: [0u8; KEY_SIZE],
            committer_data_key: [0u8; KEY_SIZE],
            responder_data_key: [0u8; KEY_SIZE],
        };
        expand(&hkdf, COMMITTER_AKE_INFO, &mut secrets.committer_ake_key)?;
        expand(&hkdf, RESPONDER_AKE_INFO, &mut secrets.responder_ake_key)?;
        expand(&hkdf, COMMITTER_DATA_INFO, &mut secrets.committer_data_key)?;
        expand(&hkdf, RESPONDER_DATA_INFO, &mut secrets.responder_data_key)?;

        Ok(secrets)
    }
}

fn expand(hkdf: &Hkdf<Sha256>, info: &[u8], output: &mut [u8]) -> Result<()> {
    hkdf.expand(info, output).map_err(|_| {
        CryptoError::KeyDerivation {
            reason: format!("HKDF expand failed for {}", String::from_utf8_lossy(info)),
        }
        .into()
    })
}

fn nonce_for(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&nonce)
}

/// Encrypt `plaintext` under `key`, authenticating `aad` as well
pub fn seal(key: &[u8; KEY_SIZE], counter: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(&nonce_for(counter), Payload { msg: plaintext, aad })
        .map_err(|_| {
            CryptoError::Encryption {
                reason: "Message encryption failed".to_string(),
            }
            .into()
        })
}

/// Decrypt and authenticate a ciphertext produced by [`seal`]
pub fn open(key: &[u8; KEY_SIZE], counter: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(&nonce_for(counter), Payload { msg: ciphertext, aad })
        .map_err(|_| {
            CryptoError::Decryption {
                reason: "Message decryption failed".to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = SessionSecrets::derive(&[7u8; 32]).unwrap();
        let b = SessionSecrets::derive(&[7u8; 32]).unwrap();
        let c = SessionSecrets::derive(&[8u8; 32]).unwrap();

        assert_eq!(a.ssid, b.ssid);
        assert_eq!(a.committer_data_key, b.committer_data_key);
        assert_ne!(a.ssid, c.ssid);
        assert_ne!(a.committer_data_key, a.responder_data_key);
    }

    #[test]
    fn test_seal_open() {
        let key = [3u8; KEY_SIZE];
        let sealed = seal(&key, 1, b"header", b"hello").unwrap();

        assert_eq!(open(&key, 1, b"header", &sealed).unwrap(), b"hello");
        assert!(open(&key, 2, b"header", &sealed).is_err());
        assert!(open(&key, 1, b"other", &sealed).is_err());
        assert!(open(&[4u8; KEY_SIZE], 1, b"header", &sealed).is_err());
    }
}
