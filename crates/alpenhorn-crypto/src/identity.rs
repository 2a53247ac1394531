//! Username validation and hashing to fixed-size identities.
//!
//! Every protocol object refers to users by a 32-byte identity derived
//! from the username, never by the variable-length string itself: fixed
//! sizes keep cover traffic indistinguishable and IBE identities uniform.

use sha2::{Digest, Sha512};
use thiserror::Error;

/// Longest acceptable username, in bytes.
pub const MAX_USERNAME_LENGTH: usize = 64;

/// Errors from username validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UsernameError {
    /// The username is empty.
    #[error("username is empty")]
    Empty,

    /// The username exceeds [`MAX_USERNAME_LENGTH`] bytes.
    #[error("username longer than {MAX_USERNAME_LENGTH} bytes")]
    TooLong,

    /// The username contains a byte outside the allowed alphabet.
    #[error("username contains invalid character {0:?}")]
    InvalidCharacter(char),
}

fn allowed(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '@' | '.' | '-' | '_')
}

/// Validate a username against the alphabet and length bounds.
pub fn validate_username(username: &str) -> Result<(), UsernameError> {
    if username.is_empty() {
        return Err(UsernameError::Empty);
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err(UsernameError::TooLong);
    }
    if let Some(c) = username.chars().find(|&c| !allowed(c)) {
        return Err(UsernameError::InvalidCharacter(c));
    }
    Ok(())
}

/// Hash a validated username to its 32-byte identity.
pub fn username_to_identity(username: &str) -> Result<[u8; 32], UsernameError> {
    validate_username(username)?;
    Ok(valid_username_to_identity(username))
}

/// Hash a username to its identity without validating it.
///
/// The empty username is accepted here: cover traffic hashes `""` so that
/// building a cover request performs exactly the same operations as
/// building a real one. Callers that accept usernames from outside must
/// use [`username_to_identity`] instead.
pub fn valid_username_to_identity(username: &str) -> [u8; 32] {
    let digest = Sha512::digest(username.as_bytes());
    let mut id = [0u8; 32];
    id.copy_from_slice(&digest[..32]);
    id
}
