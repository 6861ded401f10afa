//! Error types and handling for the OTR overlay.
//!
//! This module provides a unified error handling system across the engine,
//! the session layer and the proxy. Protocol conditions that the overlay
//! reports as notices (unreadable messages, wrong-state traffic) are not
//! errors and never travel through these types.

use thiserror::Error;

/// Result type alias for the overlay library
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Comprehensive error type for all overlay operations
#[derive(Error, Debug, Clone)]
pub enum OverlayError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Session and proxy errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Durable storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Key generation failure
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// Zero-knowledge proof or group element check failure
    #[error("Proof verification failed: {reason}")]
    ProofVerification { reason: String },
}

/// Errors raised by the protocol engine
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// The account has no private key yet
    #[error("No private key for account {account}")]
    NoPrivateKey { account: String },

    /// The current policy forbids the requested operation
    #[error("Operation not permitted by policy {policy}")]
    PolicyViolation { policy: String },

    /// Operation requires an encrypted conversation
    #[error("Conversation with {peer} is not encrypted")]
    NotEncrypted { peer: String },

    /// Encoded protocol message could not be parsed
    #[error("Malformed protocol message: {reason}")]
    Malformed { reason: String },

    /// Unsupported protocol version
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u16 },

    /// Message exceeds the accepted size
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// SMP operation issued in the wrong state
    #[error("Invalid SMP state: {state}")]
    InvalidSmpState { state: String },
}

/// Session and proxy errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The proxy is not attached to a transport channel
    #[error("Proxy is not connected")]
    NotConnected,

    /// The engine refused to encrypt the message
    #[error("Message could not be encrypted for {peer}")]
    EncryptionFailed { peer: String },

    /// The transport rejected the message
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Invalid session state for operation
    #[error("Invalid session state: {state}")]
    InvalidState { state: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Durable storage errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// A storage file could not be read
    #[error("Failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    /// A storage file could not be written
    #[error("Failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    /// A storage file has invalid content
    #[error("Corrupt entry in {path} at line {line}")]
    Corrupt { path: String, line: usize },
}

impl OverlayError {
    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Engine(EngineError::NoPrivateKey { .. })
                | Self::Engine(EngineError::NotEncrypted { .. })
                | Self::Session(SessionError::Transport { .. })
        )
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureVerification)
                | Self::Crypto(CryptoError::Decryption { .. })
                | Self::Crypto(CryptoError::ProofVerification { .. })
        )
    }
}

impl From<std::io::Error> for OverlayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for OverlayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for OverlayError {
    fn from(err: bincode::Error) -> Self {
        Self::Engine(EngineError::Malformed {
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = OverlayError::Crypto(CryptoError::InvalidKey {
            reason: "Invalid key length".to_string(),
        });
        assert!(error.to_string().contains("Invalid key"));

        let error = OverlayError::Session(SessionError::NotConnected);
        assert_eq!(error.to_string(), "Session error: Proxy is not connected");
    }

    #[test]
    fn test_error_recovery() {
        let missing_key = OverlayError::Engine(EngineError::NoPrivateKey {
            account: "alice".to_string(),
        });
        assert!(missing_key.is_recoverable());

        let crypto_error = OverlayError::Crypto(CryptoError::SignatureVerification);
        assert!(!crypto_error.is_recoverable());
    }

    #[test]
    fn test_security_violations() {
        let proof_error = OverlayError::Crypto(CryptoError::ProofVerification {
            reason: "bad schnorr proof".to_string(),
        });
        assert!(proof_error.is_security_violation());

        let not_connected = OverlayError::Session(SessionError::NotConnected);
        assert!(!not_connected.is_security_violation());
    }

    #[test]
    fn test_bincode_error_is_malformed() {
        let err: bincode::Error = bincode::deserialize::<u64>(&[1u8]).unwrap_err();
        let converted: OverlayError = err.into();
        assert!(matches!(
            converted,
            OverlayError::Engine(EngineError::Malformed { .. })
        ));
    }
}
