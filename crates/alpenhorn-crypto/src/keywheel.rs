//! The keywheel: per-friend chains of per-round shared secrets.
//!
//! When two users become friends, the add-friend protocol leaves them with
//! one 32-byte shared secret anchored at a dialing round. The keywheel
//! turns that seed into a deterministic secret for every later round by an
//! HKDF chain, advancing a per-friend head and discarding everything
//! behind it: once the wheel has turned past a round, keys for earlier
//! rounds cannot be produced again, which is what makes old dialing
//! tokens worthless to anyone who later compromises the client.
//!
//! The wheel persists separately from the client state and must not be
//! backed up; a restored backup would resurrect erased rounds.

use std::collections::HashMap;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroize;

/// Version byte leading the marshaled wheel.
const WHEEL_VERSION: u8 = 1;

/// Errors from unmarshaling a persisted wheel.
#[derive(Debug, Error)]
pub enum KeywheelError {
    /// The blob is empty or carries an unknown version byte.
    #[error("unsupported keywheel version {0}")]
    UnsupportedVersion(u8),

    /// The blob body failed to decode.
    #[error("malformed keywheel blob: {0}")]
    Malformed(String),
}

#[derive(Clone, Serialize, Deserialize)]
struct Entry {
    round: u32,
    secret: [u8; 32],
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// The keywheel over all confirmed friends.
#[derive(Default)]
pub struct Keywheel {
    entries: HashMap<String, Entry>,
}

fn advance_once(secret: &[u8; 32], next_round: u32) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, secret);
    let mut info = Vec::with_capacity(24);
    info.extend_from_slice(b"alpenhorn keywheel round");
    info.extend_from_slice(&next_round.to_le_bytes());
    let mut next = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut next) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    next
}

fn derive_from(head_round: u32, head_secret: &[u8; 32], round: u32) -> [u8; 32] {
    let mut secret = *head_secret;
    for r in head_round..round {
        let next = advance_once(&secret, r + 1);
        secret.zeroize();
        secret = next;
    }
    secret
}

impl Keywheel {
    /// Create an empty wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the wheel for a friend with a secret valid from `round`.
    pub fn put(&mut self, username: &str, round: u32, secret: [u8; 32]) {
        self.entries.insert(username.to_string(), Entry { round, secret });
    }

    /// The session key for a friend at `round`, advancing the wheel.
    ///
    /// Advancing discards the secrets for all earlier rounds. Returns
    /// `None` for unknown friends and for rounds the wheel has already
    /// turned past.
    pub fn session_key(&mut self, username: &str, round: u32) -> Option<[u8; 32]> {
        let entry = self.entries.get_mut(username)?;
        if round < entry.round {
            return None;
        }
        let secret = derive_from(entry.round, &entry.secret, round);
        entry.secret.zeroize();
        entry.round = round;
        entry.secret = secret;
        Some(secret)
    }

    /// The session key at `round` without advancing the wheel.
    ///
    /// Used for speculative derivations where the round is not yet
    /// settled; forward secrecy is preserved because nothing is stored.
    pub fn unconfirmed_session_key(&self, username: &str, round: u32) -> Option<[u8; 32]> {
        let entry = self.entries.get(username)?;
        if round < entry.round {
            return None;
        }
        Some(derive_from(entry.round, &entry.secret, round))
    }

    /// The dial token a friend would place in the round's bloom filter.
    ///
    /// Advances the wheel to `round`. The token is bound to the intent so
    /// filters cannot be probed across intents.
    pub fn dial_token(&mut self, username: &str, round: u32, intent: u32) -> Option<[u8; 32]> {
        let session = self.session_key(username, round)?;
        let hkdf = Hkdf::<Sha256>::new(None, &session);
        let mut info = Vec::with_capacity(24);
        info.extend_from_slice(b"alpenhorn dial token");
        info.extend_from_slice(&intent.to_le_bytes());
        let mut token = [0u8; 32];
        let Ok(()) = hkdf.expand(&info, &mut token) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };
        Some(token)
    }

    /// Forget a friend's chain entirely.
    pub fn erase(&mut self, username: &str) {
        self.entries.remove(username);
    }

    /// Usernames with a live chain.
    pub fn friends(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Whether a friend has a live chain.
    pub fn contains(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    /// Serialize to the versioned persistence blob.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = vec![WHEEL_VERSION];
        // The entry map is plain data; CBOR serialization cannot fail.
        #[allow(clippy::expect_used)]
        ciborium::ser::into_writer(&self.entries, &mut out)
            .expect("keywheel CBOR serialization is infallible");
        out
    }

    /// Restore a wheel from a persistence blob.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, KeywheelError> {
        let (&version, body) =
            bytes.split_first().ok_or(KeywheelError::UnsupportedVersion(0))?;
        if version != WHEEL_VERSION {
            return Err(KeywheelError::UnsupportedVersion(version));
        }
        let entries = ciborium::de::from_reader(body)
            .map_err(|e| KeywheelError::Malformed(e.to_string()))?;
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_is_deterministic() {
        let mut a = Keywheel::new();
        let mut b = Keywheel::new();
        a.put("bob", 10, [1u8; 32]);
        b.put("alice", 10, [1u8; 32]);

        assert_eq!(a.session_key("bob", 15), b.session_key("alice", 15));
    }

    #[test]
    fn advancing_erases_earlier_rounds() {
        let mut wheel = Keywheel::new();
        wheel.put("bob", 1, [2u8; 32]);

        let at_5 = wheel.session_key("bob", 5).unwrap();
        // Same round again is stable.
        assert_eq!(wheel.session_key("bob", 5), Some(at_5));
        // Advancing past it...
        wheel.session_key("bob", 6).unwrap();
        // ...makes round 5 unreachable.
        assert_eq!(wheel.session_key("bob", 5), None);
    }

    #[test]
    fn unconfirmed_key_does_not_advance() {
        let mut wheel = Keywheel::new();
        wheel.put("bob", 1, [3u8; 32]);

        let speculative = wheel.unconfirmed_session_key("bob", 9).unwrap();
        // The head has not moved; round 4 is still derivable.
        assert!(wheel.session_key("bob", 4).is_some());
        // And the speculative value matches the real one once confirmed.
        assert_eq!(wheel.session_key("bob", 9), Some(speculative));
    }

    #[test]
    fn unknown_friend_yields_nothing() {
        let mut wheel = Keywheel::new();
        assert_eq!(wheel.session_key("nobody", 1), None);
        assert_eq!(wheel.unconfirmed_session_key("nobody", 1), None);
        assert_eq!(wheel.dial_token("nobody", 1, 0), None);
    }

    #[test]
    fn dial_tokens_differ_per_intent_and_round() {
        let mut wheel = Keywheel::new();
        wheel.put("bob", 1, [4u8; 32]);

        let t0 = wheel.dial_token("bob", 5, 0).unwrap();
        let t1 = wheel.dial_token("bob", 5, 1).unwrap();
        assert_ne!(t0, t1);

        let later = wheel.dial_token("bob", 6, 0).unwrap();
        assert_ne!(t0, later);
    }

    #[test]
    fn erase_removes_the_chain() {
        let mut wheel = Keywheel::new();
        wheel.put("bob", 1, [5u8; 32]);
        wheel.erase("bob");
        assert!(!wheel.contains("bob"));
        assert_eq!(wheel.session_key("bob", 2), None);
    }

    #[test]
    fn marshal_round_trip_preserves_derivations() {
        let mut wheel = Keywheel::new();
        wheel.put("bob", 7, [6u8; 32]);
        wheel.session_key("bob", 9).unwrap();

        let blob = wheel.marshal();
        let mut restored = Keywheel::unmarshal(&blob).unwrap();

        assert_eq!(restored.session_key("bob", 12), wheel.session_key("bob", 12));
    }

    #[test]
    fn unmarshal_rejects_unknown_version() {
        let mut blob = Keywheel::new().marshal();
        blob[0] = 99;
        assert!(matches!(
            Keywheel::unmarshal(&blob),
            Err(KeywheelError::UnsupportedVersion(99))
        ));
    }
}
