//! Mix messages: the innermost onion payloads.
//!
//! Both protocols route a fixed-size message through their mix chain. The
//! mailbox field addresses the CDN bucket the final mixer should file the
//! payload under; the payload is an IBE-encrypted introduction (add-friend)
//! or a dial token (dialing).
//!
//! # Invariants
//!
//! - Encoded sizes are constants. A cover message and a real message encode
//!   to identical lengths, so neither the mixers nor a network observer can
//!   distinguish them by size.
//! - The cover mailbox is `num_mailboxes` itself, one past the last real
//!   mailbox; the final mixer discards messages addressed there.

use crate::{errors::WireError, intro::SIZE_INTRO};

/// IBE ciphertext expansion: a compressed G2 point plus an AEAD tag.
pub const ENCRYPTED_INTRO_OVERHEAD: usize = 96 + 16;

/// Size of an IBE-encrypted introduction.
pub const SIZE_ENCRYPTED_INTRO: usize = SIZE_INTRO + ENCRYPTED_INTRO_OVERHEAD;

/// Encoded size of an add-friend mix message.
pub const SIZE_MIX_MESSAGE: usize = 8 + SIZE_ENCRYPTED_INTRO;

/// Size of a dialing token.
pub const SIZE_DIAL_TOKEN: usize = 32;

/// Encoded size of a dialing mix message.
pub const SIZE_DIAL_MESSAGE: usize = 8 + SIZE_DIAL_TOKEN;

/// Add-friend mix message: `mailbox[8, LE] ‖ encrypted-intro`.
#[derive(Clone, PartialEq, Eq)]
pub struct MixMessage {
    /// Destination mailbox index; `num_mailboxes` for cover traffic.
    pub mailbox: u64,
    /// IBE-encrypted introduction, or zeros for cover traffic.
    pub encrypted_intro: [u8; SIZE_ENCRYPTED_INTRO],
}

impl MixMessage {
    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIZE_MIX_MESSAGE);
        out.extend_from_slice(&self.mailbox.to_le_bytes());
        out.extend_from_slice(&self.encrypted_intro);
        out
    }

    /// Decode from exactly [`SIZE_MIX_MESSAGE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != SIZE_MIX_MESSAGE {
            return Err(WireError::BadLength { expected: SIZE_MIX_MESSAGE, got: bytes.len() });
        }
        let mut mailbox = [0u8; 8];
        mailbox.copy_from_slice(&bytes[..8]);
        let mut encrypted_intro = [0u8; SIZE_ENCRYPTED_INTRO];
        encrypted_intro.copy_from_slice(&bytes[8..]);
        Ok(Self { mailbox: u64::from_le_bytes(mailbox), encrypted_intro })
    }
}

impl std::fmt::Debug for MixMessage {
    // Ciphertext contents are noise; keep logs readable.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixMessage").field("mailbox", &self.mailbox).finish_non_exhaustive()
    }
}

/// Dialing mix message: `mailbox[8, LE] ‖ token[32]`.
#[derive(Clone, PartialEq, Eq)]
pub struct DialMessage {
    /// Destination mailbox index; `num_mailboxes` for cover traffic.
    pub mailbox: u64,
    /// Per-round dial token derived from the keywheel.
    pub token: [u8; SIZE_DIAL_TOKEN],
}

impl DialMessage {
    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIZE_DIAL_MESSAGE);
        out.extend_from_slice(&self.mailbox.to_le_bytes());
        out.extend_from_slice(&self.token);
        out
    }

    /// Decode from exactly [`SIZE_DIAL_MESSAGE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != SIZE_DIAL_MESSAGE {
            return Err(WireError::BadLength { expected: SIZE_DIAL_MESSAGE, got: bytes.len() });
        }
        let mut mailbox = [0u8; 8];
        mailbox.copy_from_slice(&bytes[..8]);
        let mut token = [0u8; SIZE_DIAL_TOKEN];
        token.copy_from_slice(&bytes[8..]);
        Ok(Self { mailbox: u64::from_le_bytes(mailbox), token })
    }
}

impl std::fmt::Debug for DialMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialMessage").field("mailbox", &self.mailbox).finish_non_exhaustive()
    }
}
