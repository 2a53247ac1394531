//! Error types for the client engine.
//!
//! Two policies apply. Failures on the client's own side (misconfiguration,
//! broken invariants, persistence) surface to the application through the
//! error event. Cryptographic failures on untrusted input never do: a
//! mailbox full of garbage, a forged introduction, or a bad PKG reply is
//! dropped where it is detected, because observable error traffic would
//! hand an attacker a probe.

use alpenhorn_proto::{ConfigChainError, WireError};
use thiserror::Error;

/// Errors produced by the client engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A network operation failed; retryable.
    #[error("transport: {0}")]
    Transport(String),

    /// A server rejected the client's credentials.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A signature on trusted-path data failed to verify.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A config chain could not be verified.
    #[error("broken config chain: {0}")]
    BrokenChain(String),

    /// A config was expired at verification time.
    #[error("config expired: {0}")]
    Expired(String),

    /// The account already exists on the PKG. Treated as success by
    /// registration paths.
    #[error("already registered")]
    AlreadyRegistered,

    /// The account does not exist on the PKG.
    #[error("not registered")]
    NotRegistered,

    /// The account exists but has not completed verification.
    #[error("not verified")]
    NotVerified,

    /// A server answered for a different round than was asked.
    #[error("round mismatch: expected {expected}, got {got}")]
    RoundMismatch {
        /// Round the client asked about.
        expected: u32,
        /// Round the server answered for.
        got: u32,
    },

    /// A message failed to parse.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A broken internal invariant; not attacker-reachable.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation can plausibly succeed.
    ///
    /// Only transport failures are transient. Cryptographic and protocol
    /// failures are terminal for the round they occurred in.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Self::MalformedMessage(err.to_string())
    }
}

impl From<ConfigChainError> for Error {
    fn from(err: ConfigChainError) -> Self {
        match err {
            ConfigChainError::Expired { .. } => Self::Expired(err.to_string()),
            ConfigChainError::SignatureMismatch { .. } => Self::InvalidSignature(err.to_string()),
            ConfigChainError::BrokenChain(_) | ConfigChainError::UnknownHash(_) => {
                Self::BrokenChain(err.to_string())
            },
        }
    }
}
