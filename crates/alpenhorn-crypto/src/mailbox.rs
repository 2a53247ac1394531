//! Mailbox addressing.
//!
//! Each round's output is bucketed into `n` mailboxes on the CDN. A user's
//! mailbox is a keyed hash of their identity under the round's published
//! mailbox key, so bucket assignment reshuffles every time the key rotates
//! but every sender agrees on where a recipient's mail goes.

use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use crate::identity::valid_username_to_identity;

/// The mailbox index for `username` among `num_mailboxes` buckets.
///
/// The empty username is the cover address: it maps to `num_mailboxes`,
/// one past the last real bucket, and the final mixer discards everything
/// filed there. Real usernames map into `0..num_mailboxes`.
pub fn mailbox(username: &str, key: &[u8; 16], num_mailboxes: u32) -> u64 {
    if username.is_empty() || num_mailboxes == 0 {
        return u64::from(num_mailboxes);
    }
    let identity = valid_username_to_identity(username);
    let mut hasher = SipHasher24::new_with_key(key);
    hasher.write(&identity);
    hasher.finish() % u64::from(num_mailboxes)
}
