//! Signed configuration objects.
//!
//! The client's entire view of the system (coordinator, PKGs, mixers, CDN)
//! comes from a `SignedConfig`. Configs form a hash chain: each one names
//! the hash of its predecessor, and is only trusted if enough of the
//! predecessor's guardians signed it. Starting from a locally trusted
//! config, the client can therefore verify any later config it is handed.
//!
//! Hashing and signing use canonical serialization: the config is reduced
//! to a `serde_json::Value`, whose object keys serialize sorted, so every
//! party computes identical bytes regardless of field order on the wire.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Domain prefix for guardian signatures over a config.
const SIGNING_CONTEXT: &[u8] = b"AlpenhornSignedConfig|";

/// Supported config schema version.
const CONFIG_VERSION: u32 = 1;

/// Errors from config chain verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigChainError {
    /// The chain of `prev_config_hash` links does not connect, or a link
    /// violates monotonicity.
    #[error("broken config chain: {0}")]
    BrokenChain(String),

    /// A link did not gather enough valid guardian signatures.
    #[error("config signatures invalid: {got} valid of {need} required")]
    SignatureMismatch {
        /// Valid signatures found.
        got: usize,
        /// Signatures the predecessor's policy requires.
        need: usize,
    },

    /// The config is expired at verification time.
    #[error("config expired at {expires}, now {now}")]
    Expired {
        /// Expiration timestamp (unix seconds).
        expires: u64,
        /// Verification timestamp (unix seconds).
        now: u64,
    },

    /// No config with the requested hash is known to the config service.
    #[error("unknown config hash {0}")]
    UnknownHash(String),
}

/// A server identity: pinned ed25519 key plus a dial address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    /// Long-term ed25519 public key the server is pinned to.
    #[serde(with = "hex")]
    pub key: [u8; 32],
    /// Network address, scheme-less host:port.
    pub address: String,
}

/// A guardian entitled to sign successor configs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Guardian {
    /// Guardian's name, informational only.
    pub username: String,
    /// Guardian's ed25519 verification key.
    #[serde(with = "hex")]
    pub key: [u8; 32],
}

/// Service-specific config payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum InnerConfig {
    /// Add-friend protocol topology.
    AddFriend {
        /// Round coordinator.
        coordinator: ServerEntry,
        /// PKG servers, in attestation order.
        pkg_servers: Vec<ServerEntry>,
        /// Mix chain, first hop first.
        mix_servers: Vec<ServerEntry>,
        /// Mailbox host.
        cdn: ServerEntry,
    },
    /// Dialing protocol topology.
    Dialing {
        /// Round coordinator.
        coordinator: ServerEntry,
        /// Mix chain, first hop first.
        mix_servers: Vec<ServerEntry>,
        /// Bloom filter host.
        cdn: ServerEntry,
    },
}

impl InnerConfig {
    /// The coordinator entry for either service.
    pub fn coordinator(&self) -> &ServerEntry {
        match self {
            Self::AddFriend { coordinator, .. } | Self::Dialing { coordinator, .. } => coordinator,
        }
    }

    /// The mix chain for either service.
    pub fn mix_servers(&self) -> &[ServerEntry] {
        match self {
            Self::AddFriend { mix_servers, .. } | Self::Dialing { mix_servers, .. } => mix_servers,
        }
    }

    /// The CDN entry for either service.
    pub fn cdn(&self) -> &ServerEntry {
        match self {
            Self::AddFriend { cdn, .. } | Self::Dialing { cdn, .. } => cdn,
        }
    }

    /// PKG servers; empty for dialing.
    pub fn pkg_servers(&self) -> &[ServerEntry] {
        match self {
            Self::AddFriend { pkg_servers, .. } => pkg_servers,
            Self::Dialing { .. } => &[],
        }
    }
}

/// A member of the config hash chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedConfig {
    /// Schema version.
    pub version: u32,
    /// Service name, `"AddFriend"` or `"Dialing"`.
    pub service: String,
    /// Creation time, unix seconds. Strictly increases along the chain.
    pub created: u64,
    /// Expiration time, unix seconds.
    pub expires: u64,
    /// Hex hash of the predecessor config; empty for a chain root.
    pub prev_config_hash: String,
    /// Service topology.
    pub inner: InnerConfig,
    /// Parties entitled to sign the successor config.
    pub guardians: Vec<Guardian>,
    /// How many guardian signatures a successor needs.
    pub guardian_threshold: usize,
    /// Guardian signatures over this config, hex key to hex signature.
    pub signatures: BTreeMap<String, String>,
}

impl SignedConfig {
    /// Canonical (sorted-key) JSON encoding of an arbitrary serializable.
    fn canonical(value: &impl Serialize) -> Vec<u8> {
        // A config is maps, strings, and integers; Value conversion cannot
        // fail for such a tree.
        #[allow(clippy::expect_used)]
        let value = serde_json::to_value(value).expect("config serializes to a JSON value");
        #[allow(clippy::expect_used)]
        serde_json::to_vec(&value).expect("JSON value serializes to bytes")
    }

    /// Hex SHA-256 hash of the canonical encoding, signatures included.
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(Self::canonical(self)))
    }

    /// The byte string guardians sign: everything except the signatures.
    pub fn signing_message(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signatures = BTreeMap::new();
        let mut msg = SIGNING_CONTEXT.to_vec();
        msg.extend_from_slice(&Self::canonical(&unsigned));
        msg
    }

    /// Add a guardian signature over this config.
    pub fn sign(&mut self, key: &SigningKey) {
        let sig = key.sign(&self.signing_message());
        self.signatures
            .insert(hex::encode(key.verifying_key().to_bytes()), hex::encode(sig.to_bytes()));
    }

    /// Structural sanity checks independent of any chain.
    pub fn validate(&self) -> Result<(), ConfigChainError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigChainError::BrokenChain(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        if self.created >= self.expires {
            return Err(ConfigChainError::BrokenChain(
                "config expires before it is created".to_string(),
            ));
        }
        if self.guardian_threshold > self.guardians.len() {
            return Err(ConfigChainError::BrokenChain(format!(
                "guardian threshold {} exceeds {} guardians",
                self.guardian_threshold,
                self.guardians.len()
            )));
        }
        Ok(())
    }

    /// Verify that `next` is a valid direct successor of `prev`.
    ///
    /// A link holds when `next` names `prev` by hash, stays within the same
    /// service, moves forward in time, is unexpired at `now`, and carries at
    /// least `prev.guardian_threshold` valid signatures from `prev`'s
    /// guardian set.
    pub fn verify_chain_link(
        prev: &SignedConfig,
        next: &SignedConfig,
        now: u64,
    ) -> Result<(), ConfigChainError> {
        next.validate()?;

        if next.prev_config_hash != prev.hash() {
            return Err(ConfigChainError::BrokenChain(
                "successor does not reference predecessor hash".to_string(),
            ));
        }
        if next.service != prev.service {
            return Err(ConfigChainError::BrokenChain(format!(
                "service changed from {} to {}",
                prev.service, next.service
            )));
        }
        if next.created <= prev.created {
            return Err(ConfigChainError::BrokenChain(
                "successor creation time does not advance".to_string(),
            ));
        }
        if now >= next.expires {
            return Err(ConfigChainError::Expired { expires: next.expires, now });
        }

        let message = next.signing_message();
        let mut valid = 0usize;
        for guardian in &prev.guardians {
            let Some(sig_hex) = next.signatures.get(&hex::encode(guardian.key)) else {
                continue;
            };
            let Ok(sig_bytes) = hex::decode(sig_hex) else {
                continue;
            };
            let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
                continue;
            };
            let Ok(key) = VerifyingKey::from_bytes(&guardian.key) else {
                continue;
            };
            if key.verify_strict(&message, &Signature::from_bytes(&sig_bytes)).is_ok() {
                valid += 1;
            }
        }

        if valid < prev.guardian_threshold {
            return Err(ConfigChainError::SignatureMismatch {
                got: valid,
                need: prev.guardian_threshold,
            });
        }
        Ok(())
    }
}
