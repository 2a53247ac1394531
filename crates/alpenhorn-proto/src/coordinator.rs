//! Messages exchanged with the coordinator over the typed socket.
//!
//! The coordinator drives both protocols round by round: it announces new
//! rounds, relays the PKG and mixnet settings for each round, and finally
//! points clients at the mailboxes. Clients answer with exactly one onion
//! per round per protocol.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Message id for round announcements.
pub const MSG_NEW_ROUND: &str = "newround";
/// Message id for PKG settings (add-friend only).
pub const MSG_PKG: &str = "pkg";
/// Message id for mixnet settings.
pub const MSG_MIX: &str = "mix";
/// Message id for mailbox announcements.
pub const MSG_MAILBOX: &str = "mailbox";
/// Message id for coordinator-reported round failures.
pub const MSG_ERROR: &str = "error";
/// Message id for client-emitted onions.
pub const MSG_ONION: &str = "onion";

/// Announcement of a new round and the config it runs under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewRound {
    /// Round number.
    pub round: u32,
    /// Hash of the [`crate::SignedConfig`] in effect for this round.
    pub config_hash: String,
}

/// Per-round key material published by one PKG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PkgRoundInfo {
    /// Compressed IBE master public key for the round.
    #[serde(with = "hex")]
    pub master_public_key: [u8; 96],
    /// Compressed BLS attestation public key for the round.
    #[serde(with = "hex")]
    pub bls_public_key: [u8; 96],
    /// Ed25519 signature by the PKG's long-term key over the round info.
    #[serde(with = "hex")]
    pub signature: [u8; 64],
}

impl PkgRoundInfo {
    fn signing_message(&self, round: u32) -> Vec<u8> {
        let mut msg = Vec::with_capacity(21 + 4 + 96 + 96);
        msg.extend_from_slice(b"AlpenhornPKGSettings");
        msg.extend_from_slice(&round.to_le_bytes());
        msg.extend_from_slice(&self.master_public_key);
        msg.extend_from_slice(&self.bls_public_key);
        msg
    }
}

/// The PKG settings for a round, keyed by hex-encoded PKG signing key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PkgSettings(
    /// Round info per PKG, keyed by the hex encoding of its signing key.
    pub BTreeMap<String, PkgRoundInfo>,
);

impl PkgSettings {
    /// Look up the round info published under a PKG signing key.
    pub fn get(&self, key: &[u8; 32]) -> Option<&PkgRoundInfo> {
        self.0.get(&hex::encode(key))
    }

    /// Verify that every expected PKG published round info and signed it.
    ///
    /// Returns false if any PKG is missing from the settings or any
    /// signature fails; partial settings are worthless because the client
    /// needs all attestation shares to build a complete multisig.
    pub fn verify(&self, round: u32, pkg_keys: &[[u8; 32]]) -> bool {
        for key_bytes in pkg_keys {
            let Some(info) = self.get(key_bytes) else {
                return false;
            };
            let Ok(key) = VerifyingKey::from_bytes(key_bytes) else {
                return false;
            };
            let sig = Signature::from_bytes(&info.signature);
            if key.verify_strict(&info.signing_message(round), &sig).is_err() {
                return false;
            }
        }
        true
    }
}

/// PKG settings announcement for an add-friend round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PkgRound {
    /// Round number.
    pub round: u32,
    /// Settings for every PKG in the round's config.
    pub pkg_settings: PkgSettings,
}

/// The mixnet parameters for a round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MixSettings {
    /// Which protocol these settings belong to (`"AddFriend"`/`"Dialing"`).
    pub service: String,
    /// Round number.
    pub round: u32,
    /// Number of real mailboxes for the round.
    pub num_mailboxes: u32,
    /// Keyed-hash key for mailbox addressing, published per round.
    #[serde(with = "hex")]
    pub mailbox_key: [u8; 16],
    /// Onion public keys of the mix chain, first hop first.
    #[serde(with = "hex_seq")]
    pub onion_keys: Vec<[u8; 32]>,
}

impl MixSettings {
    /// The canonical byte string every mixer signs.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(b"AlpenhornMixSettings");
        msg.extend_from_slice(self.service.as_bytes());
        msg.push(0);
        msg.extend_from_slice(&self.round.to_le_bytes());
        msg.extend_from_slice(&self.num_mailboxes.to_le_bytes());
        msg.extend_from_slice(&self.mailbox_key);
        msg.extend_from_slice(&(self.onion_keys.len() as u32).to_le_bytes());
        for key in &self.onion_keys {
            msg.extend_from_slice(key);
        }
        msg
    }
}

/// Mixnet settings announcement, carrying one signature per mixer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MixRound {
    /// The settings being announced.
    pub mix_settings: MixSettings,
    /// Signatures over [`MixSettings::signing_message`], one per mixer in
    /// config order.
    #[serde(with = "hex_seq")]
    pub mix_signatures: Vec<[u8; 64]>,
}

/// Mailbox announcement: where to fetch this round's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailboxUrl {
    /// Round number.
    pub round: u32,
    /// Base URL under the CDN for this round's mailboxes.
    pub url: String,
    /// Number of real mailboxes the round was mixed into.
    pub num_mailboxes: u32,
}

/// A round failure reported by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundError {
    /// Round that failed.
    pub round: u32,
    /// Human-readable description.
    pub message: String,
}

/// The client's single per-round output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnionMsg {
    /// Round the onion belongs to.
    pub round: u32,
    /// Sealed onion for the round's mix chain.
    #[serde(with = "hex")]
    pub onion: Vec<u8>,
}

/// Hex serde for sequences of fixed-size byte arrays.
mod hex_seq {
    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeSeq};

    pub fn serialize<S: Serializer, const N: usize>(
        items: &Vec<[u8; N]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
            seq.serialize_element(&hex::encode(item))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<Vec<[u8; N]>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .into_iter()
            .map(|s| {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                <[u8; N]>::try_from(bytes.as_slice())
                    .map_err(|_| serde::de::Error::custom("wrong key length"))
            })
            .collect()
    }
}
