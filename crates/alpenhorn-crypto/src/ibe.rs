//! Identity-based encryption for introductions.
//!
//! Boneh-Franklin style IBE over BLS12-381: the sender encrypts to the
//! recipient's 32-byte identity under the round's aggregated master public
//! key, with no prior key exchange. Each PKG holds one share `s_i` of the
//! master secret and issues the per-round identity key share
//! `d_i = s_i * H(identity)`; the client sums the shares into the full
//! decryption key, and master public keys aggregate the same way.
//!
//! Hybrid construction: the pairing derives a symmetric key, the payload is
//! sealed with ChaCha20-Poly1305. The AEAD nonce is zero because the key is
//! unique per ciphertext (fresh ephemeral scalar on encrypt).
//!
//! Decryption failures return `None` with no further detail: mailbox scans
//! feed this function attacker-controlled bytes, and failures must stay
//! silent.

use blstrs::{Compress, G1Projective, G2Affine, G2Projective, Gt, Scalar, pairing};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use ff::Field;
use group::{Curve, Group, prime::PrimeCurveAffine};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// Domain separation tag for hashing identities into G1.
const IBE_DST: &[u8] = b"ALPENHORN_IBE_BLS12381G1_XMD:SHA-256_SSWU_RO_ID_";

/// Compressed master public key size.
pub const MASTER_KEY_SIZE: usize = 96;

/// Compressed identity private key (share) size.
pub const PRIVATE_SHARE_SIZE: usize = 48;

/// Ciphertext expansion over the plaintext: a compressed G2 point plus the
/// AEAD tag. Must stay in lockstep with the wire-format constant.
pub const CIPHERTEXT_OVERHEAD: usize = 96 + 16;

/// One PKG's share of the master secret.
#[derive(Clone)]
pub struct MasterSecretKey(Scalar);

/// A (possibly aggregated) master public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterPublicKey(G2Projective);

/// A (possibly aggregated) identity private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityPrivateKey(G1Projective);

fn identity_point(identity: &[u8; 32]) -> G1Projective {
    G1Projective::hash_to_curve(identity, IBE_DST, &[])
}

fn symmetric_key(shared: Gt) -> [u8; 32] {
    let mut bytes = Vec::with_capacity(288);
    // Writing into a Vec cannot fail.
    let Ok(()) = shared.write_compressed(&mut bytes) else {
        unreachable!("Gt compression into a Vec is infallible");
    };
    let mut key = [0u8; 32];
    key.copy_from_slice(&Sha256::digest(&bytes));
    key
}

impl MasterSecretKey {
    /// Generate a fresh master secret share.
    pub fn random(rng: &mut impl RngCore) -> Self {
        Self(Scalar::random(rng))
    }

    /// Generate a fresh master secret share from the system RNG.
    pub fn generate() -> Self {
        Self::random(&mut OsRng)
    }

    /// The share's master public key.
    pub fn public_key(&self) -> MasterPublicKey {
        MasterPublicKey(G2Projective::generator() * self.0)
    }

    /// Extract the identity private key share for an identity.
    pub fn extract(&self, identity: &[u8; 32]) -> IdentityPrivateKey {
        IdentityPrivateKey(identity_point(identity) * self.0)
    }
}

impl MasterPublicKey {
    /// Sum per-PKG master keys into the aggregate encryption key.
    pub fn aggregate(keys: &[MasterPublicKey]) -> Self {
        let mut sum = G2Projective::identity();
        for key in keys {
            sum += key.0;
        }
        Self(sum)
    }

    /// Compressed encoding.
    pub fn to_compressed(&self) -> [u8; MASTER_KEY_SIZE] {
        self.0.to_affine().to_compressed()
    }

    /// Decode a compressed key; `None` for malformed input.
    pub fn from_compressed(bytes: &[u8; MASTER_KEY_SIZE]) -> Option<Self> {
        let affine: Option<G2Affine> = G2Affine::from_compressed(bytes).into();
        affine.map(|a| Self(a.to_curve()))
    }
}

impl IdentityPrivateKey {
    /// Sum the per-PKG shares into the full decryption key.
    pub fn aggregate(shares: &[IdentityPrivateKey]) -> Self {
        let mut sum = G1Projective::identity();
        for share in shares {
            sum += share.0;
        }
        Self(sum)
    }

    /// Compressed encoding.
    pub fn to_compressed(&self) -> [u8; PRIVATE_SHARE_SIZE] {
        self.0.to_affine().to_compressed()
    }

    /// Decode a compressed share; `None` for malformed input.
    pub fn from_compressed(bytes: &[u8; PRIVATE_SHARE_SIZE]) -> Option<Self> {
        let affine: Option<blstrs::G1Affine> = blstrs::G1Affine::from_compressed(bytes).into();
        affine.map(|a| Self(a.to_curve()))
    }
}

/// Encrypt `msg` to `identity` under the aggregated master key.
///
/// Output layout: `U[96] ‖ aead-ciphertext`, where `U = r * g2` for a fresh
/// scalar `r`. The length is `msg.len() + CIPHERTEXT_OVERHEAD` regardless of
/// content, which the cover-traffic discipline depends on.
pub fn encrypt(
    rng: &mut impl RngCore,
    master: &MasterPublicKey,
    identity: &[u8; 32],
    msg: &[u8],
) -> Vec<u8> {
    let r = Scalar::random(rng);
    let u = G2Projective::generator() * r;

    let shared = pairing(&(identity_point(identity) * r).to_affine(), &master.0.to_affine());
    let key = symmetric_key(shared);

    let cipher = ChaCha20Poly1305::new((&key).into());
    // Key is unique per ciphertext (fresh r), so the zero nonce is safe.
    #[allow(clippy::expect_used)]
    let sealed = cipher
        .encrypt(&Nonce::default(), msg)
        .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers");

    let mut out = Vec::with_capacity(96 + sealed.len());
    out.extend_from_slice(&u.to_affine().to_compressed());
    out.extend_from_slice(&sealed);
    out
}

/// Attempt to decrypt a ciphertext with the aggregated identity key.
///
/// Returns `None` on any failure: wrong recipient, malformed point,
/// truncated input, or forged tag. Callers scanning mailboxes treat all of
/// these identically and silently.
pub fn decrypt(private_key: &IdentityPrivateKey, ciphertext: &[u8]) -> Option<Vec<u8>> {
    if ciphertext.len() < CIPHERTEXT_OVERHEAD {
        return None;
    }

    let mut u_bytes = [0u8; 96];
    u_bytes.copy_from_slice(&ciphertext[..96]);
    let u: Option<G2Affine> = G2Affine::from_compressed(&u_bytes).into();
    let u = u?;

    let shared = pairing(&private_key.0.to_affine(), &u);
    let key = symmetric_key(shared);

    let cipher = ChaCha20Poly1305::new((&key).into());
    cipher.decrypt(&Nonce::default(), &ciphertext[96..]).ok()
}
