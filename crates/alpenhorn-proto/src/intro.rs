//! The introduction: the fixed-layout message exchanged during add-friend.
//!
//! An introduction travels IBE-encrypted through the add-friend mixnet and
//! lands in the recipient's mailbox. Its layout is byte-exact because every
//! ciphertext in a mailbox must have the same length, real or cover:
//!
//! ```text
//! identity[32] ‖ long-term-key[32] ‖ dh-public[32] ‖ dialing-round[4, LE]
//!   ‖ server-multisig[48] ‖ signature[64]
//! ```
//!
//! The server multisig is the aggregated BLS attestation from all PKGs
//! binding the sender's identity to their long-term key; verifying it
//! requires the round's PKG keys and happens in the engine. The trailing
//! ed25519 signature is self-contained and verified here.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::errors::WireError;

/// Total encoded size of an introduction.
pub const SIZE_INTRO: usize = 212;

/// Bytes covered by the trailing ed25519 signature.
const SIGNED_LEN: usize = SIZE_INTRO - 64;

/// Domain separation prefix for the introduction signature.
const SIGNING_CONTEXT: &[u8] = b"AlpenhornIntroduction";

/// A decoded introduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    /// Sender's hashed identity.
    pub identity: [u8; 32],
    /// Sender's long-term ed25519 public key.
    pub long_term_key: [u8; 32],
    /// Sender's fresh Diffie-Hellman public key for this request.
    pub dh_public: [u8; 32],
    /// Dialing round the sender will listen on.
    pub dialing_round: u32,
    /// Aggregated BLS attestation over the sender's identity binding.
    pub server_multisig: [u8; 48],
    /// Ed25519 signature by `long_term_key` over the rest of the layout.
    pub signature: [u8; 64],
}

impl Introduction {
    /// Encode to the fixed 212-byte layout.
    pub fn encode(&self) -> [u8; SIZE_INTRO] {
        let mut out = [0u8; SIZE_INTRO];
        out[0..32].copy_from_slice(&self.identity);
        out[32..64].copy_from_slice(&self.long_term_key);
        out[64..96].copy_from_slice(&self.dh_public);
        out[96..100].copy_from_slice(&self.dialing_round.to_le_bytes());
        out[100..148].copy_from_slice(&self.server_multisig);
        out[148..212].copy_from_slice(&self.signature);
        out
    }

    /// Decode from exactly 212 bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != SIZE_INTRO {
            return Err(WireError::BadLength { expected: SIZE_INTRO, got: bytes.len() });
        }

        let mut identity = [0u8; 32];
        identity.copy_from_slice(&bytes[0..32]);
        let mut long_term_key = [0u8; 32];
        long_term_key.copy_from_slice(&bytes[32..64]);
        let mut dh_public = [0u8; 32];
        dh_public.copy_from_slice(&bytes[64..96]);
        let mut round_bytes = [0u8; 4];
        round_bytes.copy_from_slice(&bytes[96..100]);
        let mut server_multisig = [0u8; 48];
        server_multisig.copy_from_slice(&bytes[100..148]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[148..212]);

        Ok(Self {
            identity,
            long_term_key,
            dh_public,
            dialing_round: u32::from_le_bytes(round_bytes),
            server_multisig,
            signature,
        })
    }

    /// The message covered by the trailing signature, with its domain prefix.
    fn signing_message(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(SIGNING_CONTEXT.len() + SIGNED_LEN);
        msg.extend_from_slice(SIGNING_CONTEXT);
        msg.extend_from_slice(&self.encode()[..SIGNED_LEN]);
        msg
    }

    /// Sign the introduction with the sender's long-term key.
    ///
    /// The signature covers everything before the signature field, so a
    /// relayed introduction cannot have any field swapped out.
    pub fn sign(&mut self, key: &SigningKey) {
        let sig = key.sign(&self.signing_message());
        self.signature = sig.to_bytes();
    }

    /// Verify the trailing signature under the embedded long-term key.
    ///
    /// This is only the self-signature; the server multisig must also be
    /// verified against the round's PKG keys before the introduction is
    /// trusted.
    pub fn verify_signature(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.long_term_key) else {
            return false;
        };
        let sig = Signature::from_bytes(&self.signature);
        key.verify_strict(&self.signing_message(), &sig).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;

    fn sample_intro(key: &SigningKey) -> Introduction {
        let mut intro = Introduction {
            identity: [1u8; 32],
            long_term_key: key.verifying_key().to_bytes(),
            dh_public: [2u8; 32],
            dialing_round: 42,
            server_multisig: [3u8; 48],
            signature: [0u8; 64],
        };
        intro.sign(key);
        intro
    }

    #[test]
    fn encode_decode_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let intro = sample_intro(&key);
        let wire = intro.encode();
        assert_eq!(wire.len(), SIZE_INTRO);
        let back = Introduction::decode(&wire).unwrap();
        assert_eq!(back, intro);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let result = Introduction::decode(&[0u8; SIZE_INTRO - 1]);
        assert!(matches!(result, Err(WireError::BadLength { expected: SIZE_INTRO, .. })));
    }

    #[test]
    fn signature_verifies() {
        let key = SigningKey::generate(&mut OsRng);
        let intro = sample_intro(&key);
        assert!(intro.verify_signature());
    }

    #[test]
    fn tampered_field_breaks_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let mut intro = sample_intro(&key);
        intro.dialing_round += 1;
        assert!(!intro.verify_signature());
    }

    #[test]
    fn swapped_key_breaks_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let mut intro = sample_intro(&key);
        intro.long_term_key = other.verifying_key().to_bytes();
        assert!(!intro.verify_signature());
    }
}
