//! Authenticated key exchange.
//!
//! Four messages establish an encrypted conversation between two long-term
//! keys:
//!
//! 1. `DhCommit`: the committing party hides its ephemeral X25519 key behind a
//!    hash commitment.
//! 2. `DhKey`: the responding party sends its ephemeral key in the clear.
//! 3. `RevealSignature`: the committer opens its commitment and sends its
//!    long-term public key with a signature over the transcript, sealed under
//!    a key derived from the Diffie-Hellman output.
//! 4. `SignatureMessage`: the responder answers with its own sealed proof.
//!
//! Sealing the identity proofs hides both long-term keys from passive
//! observers and confirms that both sides derived the same secret.

use crate::crypto::cipher::{self, SessionSecrets, KEY_SIZE};
use crate::crypto::identity::{verify_signature, PrivateKey, PublicKeyBytes};
use crate::utils::{CryptoError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Instant;
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};

/// Domain separation for the commitment hash
const COMMITMENT_LABEL: &[u8] = b"otr-overlay-commit";

/// Domain separation for the signed transcript
const TRANSCRIPT_LABEL: &[u8] = b"otr-overlay-ake";

/// Associated data for the sealed identity proofs
const REVEAL_AAD: &[u8] = b"reveal-signature";
const SIGNATURE_AAD: &[u8] = b"signature";

/// First AKE message: commitment to the committer's ephemeral key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhCommit {
    /// SHA-256 over the ephemeral public key and a random nonce
    pub commitment: [u8; 32],
}

/// Second AKE message: the responder's ephemeral key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhKey {
    /// X25519 public key
    pub public_key: [u8; 32],
}

/// Third AKE message: the committer opens its commitment and proves identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevealSignature {
    /// The committed X25519 public key
    pub public_key: [u8; 32],
    /// Nonce used in the commitment
    pub nonce: [u8; 32],
    /// Sealed [`IdentityProof`]
    #[serde(with = "serde_bytes")]
    pub sealed_identity: Vec<u8>,
}

/// Fourth AKE message: the responder proves identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureMessage {
    /// Sealed [`IdentityProof`]
    #[serde(with = "serde_bytes")]
    pub sealed_identity: Vec<u8>,
}

/// Long-term key plus signature over the transcript
#[derive(Serialize, Deserialize)]
struct IdentityProof {
    public_key: PublicKeyBytes,
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
}

/// Which side of the exchange we played
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AkeRole {
    /// Sent the `DhCommit`
    Committer,
    /// Answered with `DhKey`
    Responder,
}

impl AkeRole {
    fn tag(self) -> u8 {
        match self {
            Self::Committer => 1,
            Self::Responder => 2,
        }
    }
}

/// Result of a completed exchange
#[derive(Debug, Clone)]
pub struct AkeOutcome {
    /// Role we played
    pub role: AkeRole,
    /// The peer's long-term public key
    pub their_public_key: PublicKeyBytes,
    /// Derived conversation secrets
    pub secrets: SessionSecrets,
}

impl AkeOutcome {
    /// Keys for (sending, receiving) data messages
    pub fn data_keys(&self) -> ([u8; KEY_SIZE], [u8; KEY_SIZE]) {
        match self.role {
            AkeRole::Committer => (
                self.secrets.committer_data_key,
                self.secrets.responder_data_key,
            ),
            AkeRole::Responder => (
                self.secrets.responder_data_key,
                self.secrets.committer_data_key,
            ),
        }
    }
}

/// Reply produced when a commitment arrives
#[derive(Debug, Clone)]
pub enum CommitReply {
    /// Our commitment wins the collision; send it again
    Resend(DhCommit),
    /// Continue as responder
    DhKey(DhKey),
}

struct EphemeralKey {
    secret: StaticSecret,
    public: DhPublicKey,
}

impl EphemeralKey {
    fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = DhPublicKey::from(&secret);
        Self { secret, public }
    }

    fn shared_secrets(&self, their_public: &[u8; 32]) -> Result<SessionSecrets> {
        let shared = self.secret.diffie_hellman(&DhPublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey {
                reason: "non-contributory ephemeral key".to_string(),
            }
            .into());
        }
        SessionSecrets::derive(shared.as_bytes())
    }
}

enum AuthState {
    None,
    AwaitingDhKey {
        ours: EphemeralKey,
        nonce: [u8; 32],
        commitment: [u8; 32],
    },
    AwaitingRevealSig {
        ours: EphemeralKey,
        their_commitment: [u8; 32],
    },
    AwaitingSig {
        ours: EphemeralKey,
        their_public: [u8; 32],
        secrets: SessionSecrets,
        reveal: RevealSignature,
    },
}

/// Key exchange progress for one conversation
pub struct Ake {
    state: AuthState,
    started: Option<Instant>,
}

impl Default for Ake {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Ake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ake")
            .field("state", &self.state_name())
            .field("started", &self.started)
            .finish()
    }
}

impl Ake {
    /// Create an idle key exchange
    pub fn new() -> Self {
        Self {
            state: AuthState::None,
            started: None,
        }
    }

    /// Name of the current state, for logging
    pub fn state_name(&self) -> &'static str {
        match self.state {
            AuthState::None => "none",
            AuthState::AwaitingDhKey { .. } => "awaiting-dh-key",
            AuthState::AwaitingRevealSig { .. } => "awaiting-reveal-signature",
            AuthState::AwaitingSig { .. } => "awaiting-signature",
        }
    }

    /// True while an exchange is underway
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, AuthState::None)
    }

    /// When the current exchange started
    pub fn started_at(&self) -> Option<Instant> {
        self.started
    }

    /// Abandon any exchange in progress
    pub fn reset(&mut self) {
        self.state = AuthState::None;
        self.started = None;
    }

    /// Start a new exchange as the committing party
    pub fn start(&mut self) -> DhCommit {
        let ours = EphemeralKey::generate();
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let commitment = commitment_for(ours.public.as_bytes(), &nonce);

        self.state = AuthState::AwaitingDhKey {
            ours,
            nonce,
            commitment,
        };
        self.started = Some(Instant::now());

        DhCommit { commitment }
    }

    /// A commitment arrived from the peer
    pub fn handle_commit(&mut self, commit: &DhCommit) -> CommitReply {
        if let AuthState::AwaitingDhKey { commitment, .. } = &self.state {
            // Both sides committed at once: the larger commitment keeps its role.
            if commitment.as_slice() > commit.commitment.as_slice() {
                return CommitReply::Resend(DhCommit {
                    commitment: *commitment,
                });
            }
        }

        let ours = match std::mem::replace(&mut self.state, AuthState::None) {
            AuthState::AwaitingRevealSig { ours, .. } => ours,
            _ => EphemeralKey::generate(),
        };
        let reply = DhKey {
            public_key: *ours.public.as_bytes(),
        };

        self.state = AuthState::AwaitingRevealSig {
            ours,
            their_commitment: commit.commitment,
        };
        self.started = Some(Instant::now());

        CommitReply::DhKey(reply)
    }

    /// The responder's ephemeral key arrived.
    ///
    /// Returns `None` when the message does not fit the current state.
    pub fn handle_dh_key(
        &mut self,
        key: &DhKey,
        identity: &PrivateKey,
        our_tag: u32,
    ) -> Result<Option<RevealSignature>> {
        match std::mem::replace(&mut self.state, AuthState::None) {
            AuthState::AwaitingDhKey { ours, nonce, .. } => {
                let secrets = ours.shared_secrets(&key.public_key)?;
                let proof = sign_transcript(
                    identity,
                    ours.public.as_bytes(),
                    &key.public_key,
                    our_tag,
                    AkeRole::Committer,
                )?;
                let sealed_identity =
                    cipher::seal(&secrets.committer_ake_key, 0, REVEAL_AAD, &proof)?;

                let reveal = RevealSignature {
                    public_key: *ours.public.as_bytes(),
                    nonce,
                    sealed_identity,
                };
                self.state = AuthState::AwaitingSig {
                    ours,
                    their_public: key.public_key,
                    secrets,
                    reveal: reveal.clone(),
                };
                Ok(Some(reveal))
            }
            AuthState::AwaitingSig {
                ours,
                their_public,
                secrets,
                reveal,
            } => {
                // A retransmitted DH key gets the same reveal; anything else is ignored.
                let resend = (their_public == key.public_key).then(|| reveal.clone());
                self.state = AuthState::AwaitingSig {
                    ours,
                    their_public,
                    secrets,
                    reveal,
                };
                Ok(resend)
            }
            other => {
                self.state = other;
                Ok(None)
            }
        }
    }

    /// The committer revealed its key and identity.
    pub fn handle_reveal_signature(
        &mut self,
        reveal: &RevealSignature,
        identity: &PrivateKey,
        our_tag: u32,
        their_tag: u32,
    ) -> Result<Option<(SignatureMessage, AkeOutcome)>> {
        let (ours, their_commitment) = match std::mem::replace(&mut self.state, AuthState::None) {
            AuthState::AwaitingRevealSig {
                ours,
                their_commitment,
            } => (ours, their_commitment),
            other => {
                self.state = other;
                return Ok(None);
            }
        };
        self.started = None;

        if commitment_for(&reveal.public_key, &reveal.nonce) != their_commitment {
            return Err(CryptoError::ProofVerification {
                reason: "revealed key does not match commitment".to_string(),
            }
            .into());
        }

        let secrets = ours.shared_secrets(&reveal.public_key)?;
        let opened = cipher::open(
            &secrets.committer_ake_key,
            0,
            REVEAL_AAD,
            &reveal.sealed_identity,
        )?;
        let their_public_key = verify_transcript(
            &opened,
            &reveal.public_key,
            ours.public.as_bytes(),
            their_tag,
            AkeRole::Committer,
        )?;

        let proof = sign_transcript(
            identity,
            &reveal.public_key,
            ours.public.as_bytes(),
            our_tag,
            AkeRole::Responder,
        )?;
        let sealed_identity = cipher::seal(&secrets.responder_ake_key, 0, SIGNATURE_AAD, &proof)?;

        Ok(Some((
            SignatureMessage { sealed_identity },
            AkeOutcome {
                role: AkeRole::Responder,
                their_public_key,
                secrets,
            },
        )))
    }

    /// The responder's identity proof arrived.
    pub fn handle_signature(
        &mut self,
        signature: &SignatureMessage,
        their_tag: u32,
    ) -> Result<Option<AkeOutcome>> {
        let (ours, their_public, secrets) = match std::mem::replace(&mut self.state, AuthState::None)
        {
            AuthState::AwaitingSig {
                ours,
                their_public,
                secrets,
                ..
            } => (ours, their_public, secrets),
            other => {
                self.state = other;
                return Ok(None);
            }
        };
        self.started = None;

        let opened = cipher::open(
            &secrets.responder_ake_key,
            0,
            SIGNATURE_AAD,
            &signature.sealed_identity,
        )?;
        let their_public_key = verify_transcript(
            &opened,
            ours.public.as_bytes(),
            &their_public,
            their_tag,
            AkeRole::Responder,
        )?;

        Ok(Some(AkeOutcome {
            role: AkeRole::Committer,
            their_public_key,
            secrets,
        }))
    }
}

fn commitment_for(public_key: &[u8; 32], nonce: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_LABEL);
    hasher.update(public_key);
    hasher.update(nonce);
    hasher.finalize().into()
}

fn transcript(
    committer_dh: &[u8; 32],
    responder_dh: &[u8; 32],
    signer: &PublicKeyBytes,
    signer_tag: u32,
    role: AkeRole,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_LABEL);
    hasher.update(committer_dh);
    hasher.update(responder_dh);
    hasher.update(signer);
    hasher.update(signer_tag.to_be_bytes());
    hasher.update([role.tag()]);
    hasher.finalize().into()
}

fn sign_transcript(
    identity: &PrivateKey,
    committer_dh: &[u8; 32],
    responder_dh: &[u8; 32],
    our_tag: u32,
    role: AkeRole,
) -> Result<Vec<u8>> {
    let public_key = identity.public_key_bytes();
    let digest = transcript(committer_dh, responder_dh, &public_key, our_tag, role);
    let proof = IdentityProof {
        public_key,
        signature: identity.sign(&digest).to_vec(),
    };
    bincode::serialize(&proof).map_err(Into::into)
}

fn verify_transcript(
    opened: &[u8],
    committer_dh: &[u8; 32],
    responder_dh: &[u8; 32],
    their_tag: u32,
    role: AkeRole,
) -> Result<PublicKeyBytes> {
    let proof: IdentityProof = bincode::deserialize(opened)?;
    let digest = transcript(committer_dh, responder_dh, &proof.public_key, their_tag, role);
    verify_signature(&proof.public_key, &digest, &proof.signature)?;
    Ok(proof.public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE_TAG: u32 = 0x1000;
    const BOB_TAG: u32 = 0x2000;

    fn run_exchange(alice: &PrivateKey, bob: &PrivateKey) -> (AkeOutcome, AkeOutcome) {
        let mut alice_ake = Ake::new();
        let mut bob_ake = Ake::new();

        let commit = bob_ake.start();
        let dh_key = match alice_ake.handle_commit(&commit) {
            CommitReply::DhKey(key) => key,
            CommitReply::Resend(_) => panic!("idle side must answer with its key"),
        };
        let reveal = bob_ake.handle_dh_key(&dh_key, bob, BOB_TAG).unwrap().unwrap();
        let (signature, alice_outcome) = alice_ake
            .handle_reveal_signature(&reveal, alice, ALICE_TAG, BOB_TAG)
            .unwrap()
            .unwrap();
        let bob_outcome = bob_ake.handle_signature(&signature, ALICE_TAG).unwrap().unwrap();

        assert!(!alice_ake.in_progress());
        assert!(!bob_ake.in_progress());
        (alice_outcome, bob_outcome)
    }

    #[test]
    fn test_full_exchange() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();

        let (alice_outcome, bob_outcome) = run_exchange(&alice, &bob);

        assert_eq!(alice_outcome.role, AkeRole::Responder);
        assert_eq!(bob_outcome.role, AkeRole::Committer);
        assert_eq!(alice_outcome.their_public_key, bob.public_key_bytes());
        assert_eq!(bob_outcome.their_public_key, alice.public_key_bytes());
        assert_eq!(alice_outcome.secrets.ssid, bob_outcome.secrets.ssid);

        let (alice_send, alice_recv) = alice_outcome.data_keys();
        let (bob_send, bob_recv) = bob_outcome.data_keys();
        assert_eq!(alice_send, bob_recv);
        assert_eq!(alice_recv, bob_send);
    }

    #[test]
    fn test_commit_collision() {
        let mut alice_ake = Ake::new();
        let mut bob_ake = Ake::new();

        let alice_commit = alice_ake.start();
        let bob_commit = bob_ake.start();

        let alice_reply = alice_ake.handle_commit(&bob_commit);
        let bob_reply = bob_ake.handle_commit(&alice_commit);

        // Exactly one side keeps committing, the other answers with its key.
        let resends = [&alice_reply, &bob_reply]
            .iter()
            .filter(|reply| matches!(reply, CommitReply::Resend(_)))
            .count();
        assert_eq!(resends, 1);
    }

    #[test]
    fn test_tampered_reveal_is_rejected() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();
        let mut alice_ake = Ake::new();
        let mut bob_ake = Ake::new();

        let commit = bob_ake.start();
        let CommitReply::DhKey(dh_key) = alice_ake.handle_commit(&commit) else {
            panic!("expected dh key");
        };
        let mut reveal = bob_ake.handle_dh_key(&dh_key, &bob, BOB_TAG).unwrap().unwrap();
        reveal.nonce[0] ^= 0xff;

        assert!(alice_ake
            .handle_reveal_signature(&reveal, &alice, ALICE_TAG, BOB_TAG)
            .is_err());
    }

    #[test]
    fn test_wrong_instance_tag_fails_signature() {
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();
        let mut alice_ake = Ake::new();
        let mut bob_ake = Ake::new();

        let commit = bob_ake.start();
        let CommitReply::DhKey(dh_key) = alice_ake.handle_commit(&commit) else {
            panic!("expected dh key");
        };
        let reveal = bob_ake.handle_dh_key(&dh_key, &bob, BOB_TAG).unwrap().unwrap();

        assert!(alice_ake
            .handle_reveal_signature(&reveal, &alice, ALICE_TAG, BOB_TAG + 1)
            .is_err());
    }

    #[test]
    fn test_out_of_state_messages_are_ignored() {
        let alice = PrivateKey::generate();
        let mut ake = Ake::new();

        let key = DhKey {
            public_key: [9u8; 32],
        };
        assert!(ake.handle_dh_key(&key, &alice, ALICE_TAG).unwrap().is_none());

        let signature = SignatureMessage {
            sealed_identity: vec![1, 2, 3],
        };
        assert!(ake.handle_signature(&signature, BOB_TAG).unwrap().is_none());
        assert!(!ake.in_progress());
    }
}
