//! Config chain fetching and verification.
//!
//! The coordinator announces rounds by config hash. When the hash is not
//! the one the client already trusts, the client walks the chain: fetch
//! the target config, follow `prev_config_hash` links back to the trusted
//! config, then verify every link forward against its predecessor's
//! guardian policy. Verified configs are cached by hash, which also makes
//! verification transitive: a chain verified in two steps equals the same
//! chain verified in one.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use alpenhorn_proto::{ConfigChainError, SignedConfig};
use async_trait::async_trait;

use crate::error::Error;

/// Hard cap on chain length per verification, against a malicious config
/// service feeding an endless chain.
const MAX_CHAIN_LENGTH: usize = 100;

/// Where configs are fetched from, by hash.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the config with the given hash; `Ok(None)` if unknown.
    async fn fetch(&self, hash: &str) -> Result<Option<SignedConfig>, Error>;
}

/// Config service client over HTTP.
pub struct HttpConfigSource {
    base_url: String,
    http: reqwest::Client,
}

impl HttpConfigSource {
    /// Point at a config service; `base_url` without a trailing slash.
    pub fn new(base_url: &str) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_string(), http: reqwest::Client::new() }
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self, hash: &str) -> Result<Option<SignedConfig>, Error> {
        let url = format!("{}/config/{hash}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Transport(format!("config service returned {}", response.status())));
        }
        let config = response
            .json::<SignedConfig>()
            .await
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        Ok(Some(config))
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Verifies config chains against a trusted root, with caching.
pub struct ConfigVerifier {
    source: Arc<dyn ConfigSource>,
    verified: Mutex<HashMap<String, SignedConfig>>,
}

impl ConfigVerifier {
    /// Create a verifier over a config source.
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self { source, verified: Mutex::new(HashMap::new()) }
    }

    async fn lookup(&self, hash: &str) -> Result<SignedConfig, Error> {
        if let Some(config) = self.cached(hash) {
            return Ok(config);
        }
        let config = self
            .source
            .fetch(hash)
            .await?
            .ok_or_else(|| Error::from(ConfigChainError::UnknownHash(hash.to_string())))?;
        if config.hash() != hash {
            return Err(Error::BrokenChain(format!(
                "config service returned a config hashing to something else than {hash}"
            )));
        }
        Ok(config)
    }

    fn cached(&self, hash: &str) -> Option<SignedConfig> {
        // Lock poisoning means a panic elsewhere; propagate by poisoning
        // further rather than masking it.
        #[allow(clippy::expect_used)]
        self.verified.lock().expect("config cache lock poisoned").get(hash).cloned()
    }

    fn remember(&self, config: &SignedConfig) {
        #[allow(clippy::expect_used)]
        self.verified
            .lock()
            .expect("config cache lock poisoned")
            .insert(config.hash(), config.clone());
    }

    /// Fetch and verify the chain from `trusted` to `target_hash`.
    ///
    /// Returns the verified chain newest-first, ending just before the
    /// trusted config. An empty chain means `target_hash` is the trusted
    /// config itself.
    pub async fn fetch_and_verify(
        &self,
        trusted: &SignedConfig,
        target_hash: &str,
    ) -> Result<Vec<SignedConfig>, Error> {
        let trusted_hash = trusted.hash();
        if target_hash == trusted_hash {
            return Ok(Vec::new());
        }

        // Walk backwards from the target to the trusted config.
        let mut chain = Vec::new();
        let mut cursor = target_hash.to_string();
        loop {
            if chain.len() >= MAX_CHAIN_LENGTH {
                return Err(Error::BrokenChain(format!(
                    "no path to trusted config within {MAX_CHAIN_LENGTH} links"
                )));
            }
            let config = self.lookup(&cursor).await?;
            let prev = config.prev_config_hash.clone();
            chain.push(config);
            if prev == trusted_hash {
                break;
            }
            if prev.is_empty() {
                return Err(Error::BrokenChain(
                    "chain root reached without meeting the trusted config".to_string(),
                ));
            }
            cursor = prev;
        }

        // Verify forward, oldest link first.
        let now = unix_now();
        let mut prev = trusted;
        for config in chain.iter().rev() {
            SignedConfig::verify_chain_link(prev, config, now)?;
            prev = config;
        }

        for config in &chain {
            self.remember(config);
        }
        Ok(chain)
    }
}
