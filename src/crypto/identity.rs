//! Long-term private keys and public key fingerprints.
//!
//! Every local account owns one Ed25519 private key. Peers recognise it by its
//! fingerprint: the first 20 bytes of the SHA-256 hash of the public key,
//! displayed as five groups of eight uppercase hex digits.

use crate::utils::{CryptoError, Result};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a fingerprint in bytes
pub const FINGERPRINT_LENGTH: usize = 20;

/// Raw public key bytes as carried in the key exchange
pub type PublicKeyBytes = [u8; PUBLIC_KEY_LENGTH];

/// Human-verifiable hash of a long-term public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FingerprintValue([u8; FINGERPRINT_LENGTH]);

impl FingerprintValue {
    /// Compute the fingerprint of a public key
    pub fn of_public_key(public_key: &PublicKeyBytes) -> Self {
        let digest = Sha256::digest(public_key);
        let mut value = [0u8; FINGERPRINT_LENGTH];
        value.copy_from_slice(&digest[..FINGERPRINT_LENGTH]);
        Self(value)
    }

    /// Wrap raw fingerprint bytes
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw fingerprint bytes
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LENGTH] {
        &self.0
    }

    /// Lowercase hex, the storage representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse either the storage or the human representation.
    /// Whitespace is ignored and case does not matter.
    pub fn from_hex(value: &str) -> Result<Self> {
        let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(compact.to_ascii_lowercase()).map_err(|_| CryptoError::InvalidKey {
            reason: format!("fingerprint is not hex: {value}"),
        })?;

        let value: [u8; FINGERPRINT_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!("fingerprint must be {FINGERPRINT_LENGTH} bytes"),
            })?;
        Ok(Self(value))
    }

    /// Five groups of eight uppercase hex digits
    pub fn human(&self) -> String {
        let upper = self.to_hex().to_ascii_uppercase();
        upper
            .as_bytes()
            .chunks(8)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for FingerprintValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.human())
    }
}

impl fmt::Debug for FingerprintValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FingerprintValue({})", self.human())
    }
}

impl FromStr for FingerprintValue {
    type Err = crate::utils::OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Long-term Ed25519 key pair of a local account
#[derive(Clone)]
pub struct PrivateKey {
    /// The secret signing key
    signing_key: SigningKey,
    /// The public verifying key
    verifying_key: VerifyingKey,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("signing_key", &"[REDACTED]")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PrivateKey {
    /// Generate a new random private key
    ///
    /// # Example
    ///
    /// ```rust
    /// use otr_overlay::crypto::PrivateKey;
    ///
    /// let key = PrivateKey::generate();
    /// assert_eq!(key.fingerprint().human().len(), 44);
    /// ```
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Restore a private key from its 32 secret bytes
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the secret key has the wrong length
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> Result<Self> {
        let secret: [u8; SECRET_KEY_LENGTH] =
            secret_bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "Invalid secret key length: expected {}, got {}",
                    SECRET_KEY_LENGTH,
                    secret_bytes.len()
                ),
            })?;

        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        self.verifying_key.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Fingerprint of this key's public half
    pub fn fingerprint(&self) -> FingerprintValue {
        FingerprintValue::of_public_key(&self.public_key_bytes())
    }

    /// Sign a message with this key
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Verify a signature made by the holder of `public_key`
pub fn verify_signature(public_key: &PublicKeyBytes, message: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key).map_err(|_| CryptoError::InvalidKey {
        reason: "Invalid public key".to_string(),
    })?;

    let signature: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| CryptoError::SignatureVerification)?;

    verifying_key
        .verify(message, &Signature::from_bytes(&signature))
        .map_err(|_| CryptoError::SignatureVerification.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_secret() {
        let original = PrivateKey::generate();
        let restored = PrivateKey::from_secret_bytes(&original.secret_key_bytes()).unwrap();

        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());
        assert_eq!(original.fingerprint(), restored.fingerprint());
        assert!(PrivateKey::from_secret_bytes(&[0u8; 12]).is_err());
    }

    #[test]
    fn test_signature_verification() {
        let key = PrivateKey::generate();
        let message = b"transcript";

        let signature = key.sign(message);
        assert!(verify_signature(&key.public_key_bytes(), message, &signature).is_ok());
        assert!(verify_signature(&key.public_key_bytes(), b"other", &signature).is_err());
        assert!(verify_signature(&key.public_key_bytes(), message, &signature[..10]).is_err());
    }

    #[test]
    fn test_fingerprint_formats() {
        let fingerprint = FingerprintValue::from_bytes([0xab; FINGERPRINT_LENGTH]);

        assert_eq!(fingerprint.to_hex(), "ab".repeat(20));
        assert_eq!(
            fingerprint.human(),
            "ABABABAB ABABABAB ABABABAB ABABABAB ABABABAB"
        );
        assert_eq!(FingerprintValue::from_hex(&fingerprint.human()).unwrap(), fingerprint);
        assert_eq!(fingerprint.to_hex().parse::<FingerprintValue>().unwrap(), fingerprint);
        assert!(FingerprintValue::from_hex("abcd").is_err());
        assert!(FingerprintValue::from_hex("zz").is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let key = PrivateKey::generate();
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains(&hex::encode(key.secret_key_bytes())));
    }
}
