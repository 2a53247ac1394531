//! BLS attestation signatures over BLS12-381.
//!
//! Each PKG signs an attestation binding a user's identity to their
//! long-term key. The signatures live in G1 (48 bytes compressed) so that
//! the shares from every PKG aggregate into a single 48-byte multisig that
//! fits the fixed introduction layout. Verification of the aggregate needs
//! only the sum of the signers' public keys, because all shares sign the
//! same message.

use blstrs::{G1Affine, G1Projective, G2Affine, G2Projective, Scalar, pairing};
use ff::Field;
use group::{Curve, Group, prime::PrimeCurveAffine};
use rand::RngCore;
use rand::rngs::OsRng;

/// Domain separation tag for attestation signatures.
pub const SIG_DST: &[u8] = b"ALPENHORN_BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_NUL_";

/// Compressed signature size in bytes.
pub const SIGNATURE_SIZE: usize = 48;

/// Compressed public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 96;

/// A BLS signing key.
#[derive(Clone)]
pub struct SecretKey(Scalar);

/// A BLS verification key in G2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(G2Projective);

/// A BLS signature (or aggregated multisig) in G1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(G1Projective);

fn hash_to_g1(msg: &[u8]) -> G1Projective {
    G1Projective::hash_to_curve(msg, SIG_DST, &[])
}

impl SecretKey {
    /// Generate a fresh signing key.
    pub fn random(rng: &mut impl RngCore) -> Self {
        Self(Scalar::random(rng))
    }

    /// Generate a fresh signing key from the system RNG.
    pub fn generate() -> Self {
        Self::random(&mut OsRng)
    }

    /// The corresponding verification key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(G2Projective::generator() * self.0)
    }

    /// Sign a message.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(hash_to_g1(msg) * self.0)
    }
}

impl PublicKey {
    /// Compressed encoding.
    pub fn to_compressed(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_affine().to_compressed()
    }

    /// Decode a compressed key; `None` for off-curve or malformed input.
    pub fn from_compressed(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Option<Self> {
        let affine: Option<G2Affine> = G2Affine::from_compressed(bytes).into();
        affine.map(|a| Self(a.to_curve()))
    }
}

impl Signature {
    /// Compressed encoding.
    pub fn to_compressed(&self) -> [u8; SIGNATURE_SIZE] {
        self.0.to_affine().to_compressed()
    }

    /// Decode a compressed signature; `None` for malformed input.
    pub fn from_compressed(bytes: &[u8; SIGNATURE_SIZE]) -> Option<Self> {
        let affine: Option<G1Affine> = G1Affine::from_compressed(bytes).into();
        affine.map(|a| Self(a.to_curve()))
    }
}

/// Aggregate signature shares into one multisig.
///
/// Only meaningful when every share signs the same message; that is the
/// attestation setting, where each PKG signs the identical binding.
pub fn aggregate(sigs: &[Signature]) -> Signature {
    let mut sum = G1Projective::identity();
    for sig in sigs {
        sum += sig.0;
    }
    Signature(sum)
}

/// Verify a (possibly aggregated) signature over one message.
///
/// For an aggregate of shares from keys `pk_1..pk_n` over message `m`,
/// checks `e(sig, g2) == e(H(m), pk_1 + .. + pk_n)`.
pub fn verify(keys: &[PublicKey], msg: &[u8], sig: &Signature) -> bool {
    if keys.is_empty() {
        return false;
    }
    let mut key_sum = G2Projective::identity();
    for key in keys {
        key_sum += key.0;
    }
    pairing(&sig.0.to_affine(), &G2Affine::generator())
        == pairing(&hash_to_g1(msg).to_affine(), &key_sum.to_affine())
}

/// Verify an aggregated signature where each signer signed its own message.
///
/// This is the mailbox-scan case: every PKG signs an attestation embedding
/// its own attest key, so the messages differ. Checks
/// `e(sig, g2) == Π e(H(m_i), pk_i)`.
pub fn verify_multi(keys: &[PublicKey], msgs: &[Vec<u8>], sig: &Signature) -> bool {
    if keys.is_empty() || keys.len() != msgs.len() {
        return false;
    }
    let mut expected = None;
    for (key, msg) in keys.iter().zip(msgs) {
        let term = pairing(&hash_to_g1(msg).to_affine(), &key.0.to_affine());
        expected = Some(match expected {
            None => term,
            Some(acc) => acc + term,
        });
    }
    match expected {
        Some(product) => pairing(&sig.0.to_affine(), &G2Affine::generator()) == product,
        None => false,
    }
}

/// The attestation byte string every PKG signs for a registered user.
///
/// Binds the PKG's own attestation key into the message so a signature
/// produced for one PKG's key list cannot be replayed under another's.
pub fn attestation_message(
    attest_key: &PublicKey,
    user_identity: &[u8; 32],
    user_long_term_key: &[u8; 32],
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20 + PUBLIC_KEY_SIZE + 32 + 32);
    msg.extend_from_slice(b"AlpenhornAttestation");
    msg.extend_from_slice(&attest_key.to_compressed());
    msg.extend_from_slice(user_identity);
    msg.extend_from_slice(user_long_term_key);
    msg
}
