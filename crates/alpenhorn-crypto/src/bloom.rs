//! Bloom filter for dialing mailboxes.
//!
//! The dialing CDN publishes each mailbox as a bloom filter over every dial
//! token routed there (real and noise). Clients never enumerate the filter;
//! they probe it with the tokens they expect from their own friends, so a
//! filter reveals nothing about who else was dialed.
//!
//! Indexing uses double hashing over a SHA-256 digest of the element:
//! `index_i = (h1 + i * h2) mod bits`.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from unmarshaling a downloaded filter.
#[derive(Debug, Error)]
pub enum BloomError {
    /// The blob is too short or inconsistent with its header.
    #[error("malformed bloom filter: {0}")]
    Malformed(String),
}

/// A fixed-size bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    num_bits: u32,
    num_hashes: u32,
    data: Vec<u64>,
}

fn element_hashes(data: &[u8]) -> (u64, u64) {
    let digest = Sha256::digest(data);
    let mut h1 = [0u8; 8];
    h1.copy_from_slice(&digest[..8]);
    let mut h2 = [0u8; 8];
    h2.copy_from_slice(&digest[8..16]);
    // Force h2 odd so probe positions cycle through all bits.
    (u64::from_be_bytes(h1), u64::from_be_bytes(h2) | 1)
}

impl Filter {
    /// Create an empty filter with `num_bits` bits and `num_hashes` probes.
    pub fn new(num_bits: u32, num_hashes: u32) -> Self {
        let words = (num_bits as usize).div_ceil(64);
        Self { num_bits, num_hashes, data: vec![0u64; words] }
    }

    /// Parameters minimizing size for `num_elements` at `fp_rate`.
    ///
    /// Standard sizing: `m = -n ln p / (ln 2)^2`, `k = (m/n) ln 2`.
    pub fn optimal(num_elements: usize, fp_rate: f64) -> (u32, u32) {
        let n = num_elements as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * fp_rate.ln() / (ln2 * ln2)).ceil();
        let k = ((m / n) * ln2).round().max(1.0);
        (m as u32, k as u32)
    }

    fn set_bit(&mut self, i: u32) {
        self.data[(i / 64) as usize] |= 1u64 << (i % 64);
    }

    fn test_bit(&self, i: u32) -> bool {
        self.data[(i / 64) as usize] & (1u64 << (i % 64)) != 0
    }

    /// Insert an element.
    pub fn set(&mut self, element: &[u8]) {
        let (h1, h2) = element_hashes(element);
        for i in 0..u64::from(self.num_hashes) {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % u64::from(self.num_bits)) as u32;
            self.set_bit(bit);
        }
    }

    /// Probe for an element. False positives at the configured rate; no
    /// false negatives.
    pub fn test(&self, element: &[u8]) -> bool {
        let (h1, h2) = element_hashes(element);
        (0..u64::from(self.num_hashes)).all(|i| {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % u64::from(self.num_bits)) as u32;
            self.test_bit(bit)
        })
    }

    /// Serialize: `num_bits u32 LE ‖ num_hashes u32 LE ‖ words u64 LE...`.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.data.len() * 8);
        out.extend_from_slice(&self.num_bits.to_le_bytes());
        out.extend_from_slice(&self.num_hashes.to_le_bytes());
        for word in &self.data {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Deserialize a downloaded filter.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, BloomError> {
        if bytes.len() < 8 {
            return Err(BloomError::Malformed("missing header".to_string()));
        }
        let num_bits = u32::from_le_bytes(
            bytes[0..4].try_into().map_err(|_| BloomError::Malformed("header".to_string()))?,
        );
        let num_hashes = u32::from_le_bytes(
            bytes[4..8].try_into().map_err(|_| BloomError::Malformed("header".to_string()))?,
        );
        if num_bits == 0 || num_hashes == 0 {
            return Err(BloomError::Malformed("zero-sized filter".to_string()));
        }

        let body = &bytes[8..];
        let words = (num_bits as usize).div_ceil(64);
        if body.len() != words * 8 {
            return Err(BloomError::Malformed(format!(
                "expected {} body bytes, got {}",
                words * 8,
                body.len()
            )));
        }
        let data = body
            .chunks_exact(8)
            .map(|chunk| {
                // chunks_exact(8) guarantees the length.
                #[allow(clippy::expect_used)]
                u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"))
            })
            .collect();
        Ok(Self { num_bits, num_hashes, data })
    }
}
