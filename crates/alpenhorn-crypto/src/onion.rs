//! Onion encryption for the mix chain.
//!
//! The client wraps its mix message in one layer per mixer, outermost layer
//! for the first hop. Each layer is an authenticated box to that mixer's
//! onion key from a fresh ephemeral x25519 key:
//!
//! ```text
//! layer_i = epk_i[32] ‖ box(plaintext_i, key = KDF(DH(esk_i, k_i)))
//! ```
//!
//! Nonces are zero everywhere. That is sound only because every ephemeral
//! keypair is generated for exactly one layer of exactly one onion, and the
//! request and reply directions use separate derived keys; per-layer key
//! freshness is the invariant the whole construction stands on, and the
//! tests pin it.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Bytes each onion layer adds: ephemeral public key plus AEAD tag.
pub const LAYER_OVERHEAD: usize = 32 + 16;

/// Derived keys for one onion layer.
///
/// The request key seals the inward layer; the reply key opens the
/// corresponding outward layer on the return path. Both come from one DH
/// shared secret but are independent, so the zero nonce is used at most
/// once per key.
pub struct LayerKey {
    request: [u8; 32],
    reply: [u8; 32],
}

impl Drop for LayerKey {
    fn drop(&mut self) {
        self.request.zeroize();
        self.reply.zeroize();
    }
}

fn derive_layer_key(shared: &[u8; 32], epk: &[u8; 32], server_key: &[u8; 32]) -> LayerKey {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(epk);
    salt[32..].copy_from_slice(server_key);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut request = [0u8; 32];
    let Ok(()) = hkdf.expand(b"alpenhorn onion request", &mut request) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    let mut reply = [0u8; 32];
    let Ok(()) = hkdf.expand(b"alpenhorn onion reply", &mut reply) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    LayerKey { request, reply }
}

fn seal_box(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.into());
    // Each derived key seals exactly one box; zero nonce per the layer
    // freshness invariant.
    #[allow(clippy::expect_used)]
    cipher
        .encrypt(&Nonce::default(), plaintext)
        .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers")
}

fn open_box(key: &[u8; 32], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher.decrypt(&Nonce::default(), ciphertext).ok()
}

/// Seal `payload` for an ordered mix chain.
///
/// Returns the outermost ciphertext (what the first hop receives) and the
/// per-layer keys, first hop first, for opening a layered reply.
pub fn seal(payload: &[u8], server_keys: &[[u8; 32]]) -> (Vec<u8>, Vec<LayerKey>) {
    let mut layer_keys: Vec<Option<LayerKey>> = (0..server_keys.len()).map(|_| None).collect();

    let mut onion = payload.to_vec();
    for (i, server_key) in server_keys.iter().enumerate().rev() {
        let esk = EphemeralSecret::random_from_rng(OsRng);
        let epk = PublicKey::from(&esk).to_bytes();
        let shared = esk.diffie_hellman(&PublicKey::from(*server_key));

        let keys = derive_layer_key(shared.as_bytes(), &epk, server_key);
        let boxed = seal_box(&keys.request, &onion);
        layer_keys[i] = Some(keys);

        let mut layer = Vec::with_capacity(32 + boxed.len());
        layer.extend_from_slice(&epk);
        layer.extend_from_slice(&boxed);
        onion = layer;
    }

    let keys = layer_keys.into_iter().flatten().collect();
    (onion, keys)
}

/// Peel one layer as mixer holding `server_secret`.
///
/// Returns the inner plaintext and the layer keys, which the mixer needs
/// to wrap its outbound reply. `None` if the layer does not authenticate.
pub fn peel(onion: &[u8], server_secret: &StaticSecret) -> Option<(Vec<u8>, LayerKey)> {
    if onion.len() < LAYER_OVERHEAD {
        return None;
    }
    let mut epk = [0u8; 32];
    epk.copy_from_slice(&onion[..32]);

    let shared = server_secret.diffie_hellman(&PublicKey::from(epk));
    let server_key = PublicKey::from(server_secret).to_bytes();
    let keys = derive_layer_key(&shared.to_bytes(), &epk, &server_key);

    let inner = open_box(&keys.request, &onion[32..])?;
    Some((inner, keys))
}

/// Wrap an outbound reply as a mixer, using the layer keys from [`peel`].
pub fn wrap_reply(keys: &LayerKey, reply: &[u8]) -> Vec<u8> {
    seal_box(&keys.reply, reply)
}

/// Open a layered reply as the client, first hop's layer outermost.
pub fn open_reply(layer_keys: &[LayerKey], mut reply: Vec<u8>) -> Option<Vec<u8>> {
    for keys in layer_keys {
        reply = open_box(&keys.reply, &reply)?;
    }
    Some(reply)
}
