//! Error types for wire-format encoding and decoding.

use thiserror::Error;

/// Errors produced while encoding or decoding wire formats.
///
/// Decoding operates on untrusted input, so every variant here is expected
/// in normal operation and callers decide whether a failure is dropped
/// silently (mailbox scans) or surfaced (coordinator envelopes).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input had a different length than the fixed layout requires.
    #[error("bad length: expected {expected} bytes, got {got}")]
    BadLength {
        /// Bytes the layout requires.
        expected: usize,
        /// Bytes actually supplied.
        got: usize,
    },

    /// A JSON envelope or payload failed to parse.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A field held a value outside its domain.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Field name as it appears on the wire.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
