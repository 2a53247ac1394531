//! Mailbox downloads from the CDN.
//!
//! After each round the coordinator announces a URL under the round's CDN;
//! clients fetch exactly one mailbox from it: their own bucket. An empty
//! or missing mailbox is normal (nobody wrote to the bucket this round).

use alpenhorn_proto::ServerEntry;
use async_trait::async_trait;

use crate::error::Error;

/// Where mailboxes are fetched from. HTTP in production, in-memory in tests.
#[async_trait]
pub trait MailboxFetcher: Send + Sync {
    /// Fetch mailbox `mailbox` under `base_url`; `Ok(None)` when the
    /// bucket does not exist for this round.
    async fn fetch(
        &self,
        cdn: &ServerEntry,
        base_url: &str,
        mailbox: u64,
    ) -> Result<Option<Vec<u8>>, Error>;
}

/// Mailbox fetcher over HTTPS.
pub struct HttpMailboxFetcher {
    http: reqwest::Client,
}

impl HttpMailboxFetcher {
    /// Create a fetcher with a fresh connection pool.
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

impl Default for HttpMailboxFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailboxFetcher for HttpMailboxFetcher {
    async fn fetch(
        &self,
        cdn: &ServerEntry,
        base_url: &str,
        mailbox: u64,
    ) -> Result<Option<Vec<u8>>, Error> {
        let url = format!("https://{}{}/{mailbox}", cdn.address, base_url);
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
            return Err(Error::Transport(format!("CDN returned {}", response.status())));
        }
        let body = response.bytes().await.map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Some(body.to_vec()))
    }
}
