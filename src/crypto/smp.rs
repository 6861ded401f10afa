//! Socialist millionaire protocol over Ristretto255.
//!
//! Two parties learn whether they hold the same secret without revealing
//! anything else about it. The initiator (Alice) and responder (Bob) exchange
//! four messages:
//!
//! - `Smp1`: Alice's `g2a`, `g3a` with Schnorr proofs
//! - `Smp2`: Bob's `g2b`, `g3b`, `Pb`, `Qb` with proofs
//! - `Smp3`: Alice's `Pa`, `Qa`, `Ra` with proofs
//! - `Smp4`: Bob's `Rb` with a Chaum-Pedersen proof
//!
//! Both sides finish by checking `Pa - Pb == Rab`.

use crate::crypto::cipher::SSID_SIZE;
use crate::crypto::identity::FingerprintValue;
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use thiserror::Error;

const SECRET_LABEL: &[u8] = b"otr-overlay-smp-secret";
const SMP_VERSION: u8 = 1;

/// Encoded group element
pub type PointBytes = [u8; 32];

/// Encoded scalar
pub type ScalarBytes = [u8; 32];

/// Why an SMP exchange stopped early
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpError {
    /// A proof failed or a group element was invalid
    #[error("peer sent an invalid SMP proof")]
    Cheated,

    /// A message arrived that the current state does not expect
    #[error("SMP message arrived out of order")]
    OutOfOrder,
}

type SmpResult<T> = std::result::Result<T, SmpError>;

/// First message, sent by the initiator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smp1 {
    pub g2a: PointBytes,
    pub c2: ScalarBytes,
    pub d2: ScalarBytes,
    pub g3a: PointBytes,
    pub c3: ScalarBytes,
    pub d3: ScalarBytes,
}

/// Second message, sent by the responder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smp2 {
    pub g2b: PointBytes,
    pub c2: ScalarBytes,
    pub d2: ScalarBytes,
    pub g3b: PointBytes,
    pub c3: ScalarBytes,
    pub d3: ScalarBytes,
    pub pb: PointBytes,
    pub qb: PointBytes,
    pub cp: ScalarBytes,
    pub d5: ScalarBytes,
    pub d6: ScalarBytes,
}

/// Third message, sent by the initiator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smp3 {
    pub pa: PointBytes,
    pub qa: PointBytes,
    pub cp: ScalarBytes,
    pub d5: ScalarBytes,
    pub d6: ScalarBytes,
    pub ra: PointBytes,
    pub cr: ScalarBytes,
    pub d7: ScalarBytes,
}

/// Final message, sent by the responder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Smp4 {
    pub rb: PointBytes,
    pub cr: ScalarBytes,
    pub d7: ScalarBytes,
}

/// Coarse progress, as reported to the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpPhase {
    /// No exchange
    Idle,
    /// The peer asked; we still need the local secret
    AwaitingSecret,
    /// Messages are in flight
    InProgress,
}

/// The compared value, bound to both fingerprints and the session id
#[derive(Clone)]
pub struct SmpSecret(Scalar);

impl std::fmt::Debug for SmpSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SmpSecret([REDACTED])")
    }
}

impl SmpSecret {
    /// Derive the SMP secret for a conversation
    pub fn derive(
        initiator: &FingerprintValue,
        responder: &FingerprintValue,
        ssid: &[u8; SSID_SIZE],
        secret: &[u8],
    ) -> Self {
        let mut input = Vec::with_capacity(SECRET_LABEL.len() + 1 + 40 + SSID_SIZE + secret.len());
        input.extend_from_slice(SECRET_LABEL);
        input.push(SMP_VERSION);
        input.extend_from_slice(initiator.as_bytes());
        input.extend_from_slice(responder.as_bytes());
        input.extend_from_slice(ssid);
        input.extend_from_slice(secret);
        Self(Scalar::hash_from_bytes::<Sha512>(&input))
    }
}

enum State {
    None,
    AwaitingSecret {
        g2a: RistrettoPoint,
        g3a: RistrettoPoint,
    },
    ExpectSmp2 {
        x: Scalar,
        a2: Scalar,
        a3: Scalar,
    },
    ExpectSmp3 {
        b3: Scalar,
        g2: RistrettoPoint,
        g3: RistrettoPoint,
        g3a: RistrettoPoint,
        pb: RistrettoPoint,
        qb: RistrettoPoint,
    },
    ExpectSmp4 {
        a3: Scalar,
        g3b: RistrettoPoint,
        pa_minus_pb: RistrettoPoint,
        qa_minus_qb: RistrettoPoint,
    },
}

/// One side of a socialist millionaire exchange
pub struct Smp {
    state: State,
}

impl Default for Smp {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Smp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Smp").field("phase", &self.phase()).finish()
    }
}

impl Smp {
    /// Create an idle exchange
    pub fn new() -> Self {
        Self { state: State::None }
    }

    /// Current coarse progress
    pub fn phase(&self) -> SmpPhase {
        match self.state {
            State::None => SmpPhase::Idle,
            State::AwaitingSecret { .. } => SmpPhase::AwaitingSecret,
            _ => SmpPhase::InProgress,
        }
    }

    /// Drop any exchange in progress
    pub fn abort(&mut self) {
        self.state = State::None;
    }

    /// Begin an exchange as initiator. Any previous exchange is abandoned.
    pub fn start(&mut self, secret: &SmpSecret) -> Smp1 {
        let a2 = Scalar::random(&mut OsRng);
        let a3 = Scalar::random(&mut OsRng);
        let (c2, d2) = prove_exponent(1, &a2);
        let (c3, d3) = prove_exponent(2, &a3);

        let message = Smp1 {
            g2a: encode(&(RISTRETTO_BASEPOINT_POINT * a2)),
            c2: c2.to_bytes(),
            d2: d2.to_bytes(),
            g3a: encode(&(RISTRETTO_BASEPOINT_POINT * a3)),
            c3: c3.to_bytes(),
            d3: d3.to_bytes(),
        };
        self.state = State::ExpectSmp2 {
            x: secret.0,
            a2,
            a3,
        };
        message
    }

    /// Handle the initiator's first message. The local secret is supplied
    /// later through [`Smp::respond`].
    pub fn receive_smp1(&mut self, message: &Smp1) -> SmpResult<()> {
        if !matches!(self.state, State::None) {
            self.state = State::None;
            return Err(SmpError::OutOfOrder);
        }

        let result = (|| -> SmpResult<State> {
            let g2a = decode_point(&message.g2a)?;
            let g3a = decode_point(&message.g3a)?;
            verify_exponent(1, &g2a, &message.c2, &message.d2)?;
            verify_exponent(2, &g3a, &message.c3, &message.d3)?;
            Ok(State::AwaitingSecret { g2a, g3a })
        })();
        self.advance(result)
    }

    /// Answer a pending request with the local secret
    pub fn respond(&mut self, secret: &SmpSecret) -> SmpResult<Smp2> {
        let (g2a, g3a) = match self.state {
            State::AwaitingSecret { g2a, g3a } => (g2a, g3a),
            _ => return Err(SmpError::OutOfOrder),
        };
        let y = secret.0;

        let b2 = Scalar::random(&mut OsRng);
        let b3 = Scalar::random(&mut OsRng);
        let (c2, d2) = prove_exponent(3, &b2);
        let (c3, d3) = prove_exponent(4, &b3);

        let g2 = g2a * b2;
        let g3 = g3a * b3;

        let r = Scalar::random(&mut OsRng);
        let pb = g3 * r;
        let qb = RISTRETTO_BASEPOINT_POINT * r + g2 * y;
        let (cp, d5, d6) = prove_pq(5, &g2, &g3, &r, &y);

        let message = Smp2 {
            g2b: encode(&(RISTRETTO_BASEPOINT_POINT * b2)),
            c2: c2.to_bytes(),
            d2: d2.to_bytes(),
            g3b: encode(&(RISTRETTO_BASEPOINT_POINT * b3)),
            c3: c3.to_bytes(),
            d3: d3.to_bytes(),
            pb: encode(&pb),
            qb: encode(&qb),
            cp: cp.to_bytes(),
            d5: d5.to_bytes(),
            d6: d6.to_bytes(),
        };
        self.state = State::ExpectSmp3 {
            b3,
            g2,
            g3,
            g3a,
            pb,
            qb,
        };
        Ok(message)
    }

    /// Handle the responder's reply
    pub fn receive_smp2(&mut self, message: &Smp2) -> SmpResult<Smp3> {
        let (x, a2, a3) = match self.state {
            State::ExpectSmp2 { x, a2, a3 } => (x, a2, a3),
            _ => {
                self.state = State::None;
                return Err(SmpError::OutOfOrder);
            }
        };

        let result = (|| -> SmpResult<(State, Smp3)> {
            let g2b = decode_point(&message.g2b)?;
            let g3b = decode_point(&message.g3b)?;
            let pb = decode_point(&message.pb)?;
            let qb = decode_point(&message.qb)?;
            verify_exponent(3, &g2b, &message.c2, &message.d2)?;
            verify_exponent(4, &g3b, &message.c3, &message.d3)?;

            let g2 = g2b * a2;
            let g3 = g3b * a3;
            verify_pq(5, &g2, &g3, &pb, &qb, &message.cp, &message.d5, &message.d6)?;

            let s = Scalar::random(&mut OsRng);
            let pa = g3 * s;
            let qa = RISTRETTO_BASEPOINT_POINT * s + g2 * x;
            let (cp, d5, d6) = prove_pq(6, &g2, &g3, &s, &x);

            let qa_minus_qb = qa - qb;
            let ra = qa_minus_qb * a3;
            let (cr, d7) = prove_equal_logs(7, &qa_minus_qb, &a3);

            let reply = Smp3 {
                pa: encode(&pa),
                qa: encode(&qa),
                cp: cp.to_bytes(),
                d5: d5.to_bytes(),
                d6: d6.to_bytes(),
                ra: encode(&ra),
                cr: cr.to_bytes(),
                d7: d7.to_bytes(),
            };
            let next = State::ExpectSmp4 {
                a3,
                g3b,
                pa_minus_pb: pa - pb,
                qa_minus_qb,
            };
            Ok((next, reply))
        })();

        match result {
            Ok((next, reply)) => {
                self.state = next;
                Ok(reply)
            }
            Err(err) => {
                self.state = State::None;
                Err(err)
            }
        }
    }

    /// Handle the initiator's third message. Returns the final message and
    /// whether the secrets matched.
    pub fn receive_smp3(&mut self, message: &Smp3) -> SmpResult<(Smp4, bool)> {
        let (b3, g2, g3, g3a, pb, qb) = match self.state {
            State::ExpectSmp3 {
                b3,
                g2,
                g3,
                g3a,
                pb,
                qb,
            } => (b3, g2, g3, g3a, pb, qb),
            _ => {
                self.state = State::None;
                return Err(SmpError::OutOfOrder);
            }
        };
        self.state = State::None;

        let pa = decode_point(&message.pa)?;
        let qa = decode_point(&message.qa)?;
        let ra = decode_point(&message.ra)?;
        verify_pq(6, &g2, &g3, &pa, &qa, &message.cp, &message.d5, &message.d6)?;

        let qa_minus_qb = qa - qb;
        verify_equal_logs(7, &g3a, &qa_minus_qb, &ra, &message.cr, &message.d7)?;

        let rb = qa_minus_qb * b3;
        let (cr, d7) = prove_equal_logs(8, &qa_minus_qb, &b3);
        let rab = ra * b3;

        let reply = Smp4 {
            rb: encode(&rb),
            cr: cr.to_bytes(),
            d7: d7.to_bytes(),
        };
        Ok((reply, rab == pa - pb))
    }

    /// Handle the final message. Returns whether the secrets matched.
    pub fn receive_smp4(&mut self, message: &Smp4) -> SmpResult<bool> {
        let (a3, g3b, pa_minus_pb, qa_minus_qb) = match self.state {
            State::ExpectSmp4 {
                a3,
                g3b,
                pa_minus_pb,
                qa_minus_qb,
            } => (a3, g3b, pa_minus_pb, qa_minus_qb),
            _ => {
                self.state = State::None;
                return Err(SmpError::OutOfOrder);
            }
        };
        self.state = State::None;

        let rb = decode_point(&message.rb)?;
        verify_equal_logs(8, &g3b, &qa_minus_qb, &rb, &message.cr, &message.d7)?;

        Ok(rb * a3 == pa_minus_pb)
    }

    fn advance(&mut self, next: SmpResult<State>) -> SmpResult<()> {
        match next {
            Ok(state) => {
                self.state = state;
                Ok(())
            }
            Err(err) => {
                self.state = State::None;
                Err(err)
            }
        }
    }
}

fn encode(point: &RistrettoPoint) -> PointBytes {
    point.compress().to_bytes()
}

fn decode_point(bytes: &PointBytes) -> SmpResult<RistrettoPoint> {
    let point = CompressedRistretto(*bytes)
        .decompress()
        .ok_or(SmpError::Cheated)?;
    if point.is_identity() {
        return Err(SmpError::Cheated);
    }
    Ok(point)
}

fn decode_scalar(bytes: &ScalarBytes) -> SmpResult<Scalar> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(SmpError::Cheated)
}

fn challenge(prefix: u8, first: &RistrettoPoint, second: Option<&RistrettoPoint>) -> Scalar {
    let mut input = Vec::with_capacity(65);
    input.push(prefix);
    input.extend_from_slice(&encode(first));
    if let Some(second) = second {
        input.extend_from_slice(&encode(second));
    }
    Scalar::hash_from_bytes::<Sha512>(&input)
}

/// Schnorr proof of knowledge of `exponent` for `G * exponent`
fn prove_exponent(prefix: u8, exponent: &Scalar) -> (Scalar, Scalar) {
    let r = Scalar::random(&mut OsRng);
    let c = challenge(prefix, &(RISTRETTO_BASEPOINT_POINT * r), None);
    (c, r - exponent * c)
}

fn verify_exponent(
    prefix: u8,
    public: &RistrettoPoint,
    c: &ScalarBytes,
    d: &ScalarBytes,
) -> SmpResult<()> {
    let c = decode_scalar(c)?;
    let d = decode_scalar(d)?;
    let commitment = RISTRETTO_BASEPOINT_POINT * d + public * c;
    if challenge(prefix, &commitment, None) == c {
        Ok(())
    } else {
        Err(SmpError::Cheated)
    }
}

/// Proof that `P = g3 * r` and `Q = G * r + g2 * secret` share `r`
fn prove_pq(
    prefix: u8,
    g2: &RistrettoPoint,
    g3: &RistrettoPoint,
    r: &Scalar,
    secret: &Scalar,
) -> (Scalar, Scalar, Scalar) {
    let r4 = Scalar::random(&mut OsRng);
    let r5 = Scalar::random(&mut OsRng);
    let c = challenge(
        prefix,
        &(g3 * r4),
        Some(&(RISTRETTO_BASEPOINT_POINT * r4 + g2 * r5)),
    );
    (c, r4 - r * c, r5 - secret * c)
}

#[allow(clippy::too_many_arguments)]
fn verify_pq(
    prefix: u8,
    g2: &RistrettoPoint,
    g3: &RistrettoPoint,
    p: &RistrettoPoint,
    q: &RistrettoPoint,
    c: &ScalarBytes,
    d5: &ScalarBytes,
    d6: &ScalarBytes,
) -> SmpResult<()> {
    let c = decode_scalar(c)?;
    let d5 = decode_scalar(d5)?;
    let d6 = decode_scalar(d6)?;
    let first = g3 * d5 + p * c;
    let second = RISTRETTO_BASEPOINT_POINT * d5 + g2 * d6 + q * c;
    if challenge(prefix, &first, Some(&second)) == c {
        Ok(())
    } else {
        Err(SmpError::Cheated)
    }
}

/// Chaum-Pedersen proof that `G * exponent` and `base * exponent` share it
fn prove_equal_logs(prefix: u8, base: &RistrettoPoint, exponent: &Scalar) -> (Scalar, Scalar) {
    let r7 = Scalar::random(&mut OsRng);
    let c = challenge(
        prefix,
        &(RISTRETTO_BASEPOINT_POINT * r7),
        Some(&(base * r7)),
    );
    (c, r7 - exponent * c)
}

fn verify_equal_logs(
    prefix: u8,
    public: &RistrettoPoint,
    base: &RistrettoPoint,
    result: &RistrettoPoint,
    c: &ScalarBytes,
    d: &ScalarBytes,
) -> SmpResult<()> {
    let c = decode_scalar(c)?;
    let d = decode_scalar(d)?;
    let first = RISTRETTO_BASEPOINT_POINT * d + public * c;
    let second = base * d + result * c;
    if challenge(prefix, &first, Some(&second)) == c {
        Ok(())
    } else {
        Err(SmpError::Cheated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(alice: &[u8], bob: &[u8]) -> (SmpSecret, SmpSecret) {
        let initiator = FingerprintValue::from_bytes([1u8; 20]);
        let responder = FingerprintValue::from_bytes([2u8; 20]);
        let ssid = [7u8; SSID_SIZE];
        (
            SmpSecret::derive(&initiator, &responder, &ssid, alice),
            SmpSecret::derive(&initiator, &responder, &ssid, bob),
        )
    }

    fn run(alice_secret: &[u8], bob_secret: &[u8]) -> (bool, bool) {
        let (x, y) = secrets(alice_secret, bob_secret);
        let mut alice = Smp::new();
        let mut bob = Smp::new();

        let smp1 = alice.start(&x);
        assert_eq!(alice.phase(), SmpPhase::InProgress);
        bob.receive_smp1(&smp1).unwrap();
        assert_eq!(bob.phase(), SmpPhase::AwaitingSecret);

        let smp2 = bob.respond(&y).unwrap();
        let smp3 = alice.receive_smp2(&smp2).unwrap();
        let (smp4, bob_result) = bob.receive_smp3(&smp3).unwrap();
        let alice_result = alice.receive_smp4(&smp4).unwrap();

        assert_eq!(alice.phase(), SmpPhase::Idle);
        assert_eq!(bob.phase(), SmpPhase::Idle);
        (alice_result, bob_result)
    }

    #[test]
    fn test_matching_secrets_succeed() {
        assert_eq!(run(b"the blue house", b"the blue house"), (true, true));
    }

    #[test]
    fn test_different_secrets_fail() {
        assert_eq!(run(b"the blue house", b"the red house"), (false, false));
    }

    #[test]
    fn test_forged_proof_is_cheating() {
        let (x, _) = secrets(b"a", b"a");
        let mut alice = Smp::new();
        let mut bob = Smp::new();

        let mut smp1 = alice.start(&x);
        smp1.c2[0] ^= 1;
        assert_eq!(bob.receive_smp1(&smp1), Err(SmpError::Cheated));
        assert_eq!(bob.phase(), SmpPhase::Idle);
    }

    #[test]
    fn test_identity_point_is_cheating() {
        let (x, _) = secrets(b"a", b"a");
        let mut alice = Smp::new();
        let mut bob = Smp::new();

        let mut smp1 = alice.start(&x);
        smp1.g2a = [0u8; 32];
        assert_eq!(bob.receive_smp1(&smp1), Err(SmpError::Cheated));
    }

    #[test]
    fn test_out_of_order_resets() {
        let (x, y) = secrets(b"a", b"a");
        let mut alice = Smp::new();
        let mut bob = Smp::new();

        let smp1 = alice.start(&x);
        bob.receive_smp1(&smp1).unwrap();
        let smp2 = bob.respond(&y).unwrap();

        // Bob never expects his own message type
        let mut carol = Smp::new();
        assert!(matches!(carol.receive_smp2(&smp2), Err(SmpError::OutOfOrder)));
        assert!(matches!(carol.respond(&y), Err(SmpError::OutOfOrder)));

        alice.abort();
        assert!(matches!(alice.receive_smp2(&smp2), Err(SmpError::OutOfOrder)));
    }

    #[test]
    fn test_secret_binds_session() {
        let fp_a = FingerprintValue::from_bytes([1u8; 20]);
        let fp_b = FingerprintValue::from_bytes([2u8; 20]);
        let one = SmpSecret::derive(&fp_a, &fp_b, &[1u8; SSID_SIZE], b"s");
        let two = SmpSecret::derive(&fp_a, &fp_b, &[2u8; SSID_SIZE], b"s");
        assert_ne!(one.0, two.0);
        assert_eq!(format!("{one:?}"), "SmpSecret([REDACTED])");
    }
}
