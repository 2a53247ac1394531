//! Friends, request queues, and the matching rules between them.
//!
//! A sent request and an incoming request pair up exactly when their
//! (identity, dial-round) agree; the identity is the hash of the username
//! the sender targeted, so this is the (username, dial-round) match
//! expressed over what actually travels on the wire. Pairing consumes both
//! sides and produces a friend; everything else queues. The store is plain
//! data guarded by the engine lock, and all mutation goes through engine
//! methods.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// A confirmed friend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Friend {
    /// The friend's username.
    pub username: String,
    /// The friend's long-term ed25519 public key.
    #[serde(with = "hex")]
    pub long_term_key: [u8; 32],
}

/// A queued request to add (or confirm) a friend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingFriendRequest {
    /// Target username.
    pub username: String,
    /// If set, the long-term key the target must present.
    pub expected_key: Option<[u8; 32]>,
    /// Whether this confirms a received request rather than opening one.
    pub confirmation: bool,
    /// For confirmations, the dial round copied from the incoming request.
    pub dial_round: Option<u32>,
}

impl OutgoingFriendRequest {
    /// A request to `username` with no key expectations.
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            expected_key: None,
            confirmation: false,
            dial_round: None,
        }
    }
}

/// The private half of an emitted friend request.
///
/// Created when the request's introduction leaves in an onion; destroyed
/// by pairing with the matching incoming request, or by expiry once its
/// dial round is long past.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentFriendRequest {
    /// Target username; empty for cover requests.
    pub username: String,
    /// Hash of the target username, as carried on the wire.
    #[serde(with = "hex")]
    pub target_identity: [u8; 32],
    /// Expected long-term key, if the user pinned one.
    pub expected_key: Option<[u8; 32]>,
    /// Whether this was a confirmation.
    pub confirmation: bool,
    /// Dial round carried in the introduction.
    pub dial_round: u32,
    /// Add-friend round the introduction went out in.
    pub sent_round: u32,
    /// Our ephemeral DH public key from the introduction.
    #[serde(with = "hex")]
    pub dh_public: [u8; 32],
    /// Our ephemeral DH private key; consumed when the friend confirms.
    #[serde(with = "hex")]
    pub dh_private: [u8; 32],
}

/// A decrypted, verified friend request found in our mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncomingFriendRequest {
    /// Sender's hashed identity as carried in the introduction.
    #[serde(with = "hex")]
    pub identity: [u8; 32],
    /// Sender's username, when the identity matched a name we were
    /// expecting (a sent or queued request, or an existing friend).
    /// Unsolicited requests arrive unresolved; the application knows the
    /// sender's name out of band and supplies it on approval.
    pub username: Option<String>,
    /// Sender's long-term ed25519 public key.
    #[serde(with = "hex")]
    pub long_term_key: [u8; 32],
    /// Sender's ephemeral DH public key.
    #[serde(with = "hex")]
    pub dh_public: [u8; 32],
    /// Dial round the sender proposed for the keywheel base.
    pub dial_round: u32,
}

/// A queued call to a friend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingCall {
    /// Friend to dial.
    pub username: String,
    /// Intent slot to dial under.
    pub intent: u32,
}

/// All friendship state, persisted as one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Store {
    /// Confirmed friends by username.
    pub friends: HashMap<String, Friend>,
    /// Requests awaiting approval or rejection by the user.
    pub incoming: Vec<IncomingFriendRequest>,
    /// Requests queued to go out, FIFO.
    pub outgoing: VecDeque<OutgoingFriendRequest>,
    /// Emitted requests awaiting the other side's introduction.
    pub sent: Vec<SentFriendRequest>,
    /// Calls queued to go out, FIFO.
    pub outgoing_calls: VecDeque<OutgoingCall>,
}

impl Store {
    /// Pop the next outgoing request, or a cover request when idle.
    ///
    /// The cover request targets the empty username; everything downstream
    /// treats it exactly like a real one so the two are indistinguishable
    /// in both timing and output.
    pub fn next_outgoing(&mut self) -> OutgoingFriendRequest {
        self.outgoing.pop_front().unwrap_or_else(|| OutgoingFriendRequest::new(""))
    }

    /// Find the earliest queued incoming request matching a sent one.
    pub fn match_to_incoming(&self, sent: &SentFriendRequest) -> Option<usize> {
        self.incoming.iter().position(|inc| {
            inc.identity == sent.target_identity && inc.dial_round == sent.dial_round
        })
    }

    /// Find the earliest queued sent request matching an incoming one.
    pub fn match_to_sent(&self, incoming: &IncomingFriendRequest) -> Option<usize> {
        self.sent.iter().position(|s| {
            s.target_identity == incoming.identity && s.dial_round == incoming.dial_round
        })
    }

    /// Remove sent requests whose dial round is more than `window` rounds
    /// behind the current dialing round; they can no longer pair.
    pub fn expire_sent(&mut self, current_dialing_round: u32, window: u32) {
        self.sent
            .retain(|s| s.dial_round.saturating_add(window) >= current_dialing_round);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(tag: u8) -> [u8; 32] {
        [tag; 32]
    }

    fn sent(username: &str, id: [u8; 32], dial_round: u32) -> SentFriendRequest {
        SentFriendRequest {
            username: username.to_string(),
            target_identity: id,
            expected_key: None,
            confirmation: false,
            dial_round,
            sent_round: 1,
            dh_public: [1u8; 32],
            dh_private: [2u8; 32],
        }
    }

    fn incoming(id: [u8; 32], dial_round: u32) -> IncomingFriendRequest {
        IncomingFriendRequest {
            identity: id,
            username: None,
            long_term_key: [3u8; 32],
            dh_public: [4u8; 32],
            dial_round,
        }
    }

    #[test]
    fn empty_queue_yields_cover_request() {
        let mut store = Store::default();
        let req = store.next_outgoing();
        assert_eq!(req.username, "");
        assert!(!req.confirmation);
    }

    #[test]
    fn outgoing_queue_is_fifo() {
        let mut store = Store::default();
        store.outgoing.push_back(OutgoingFriendRequest::new("bob"));
        store.outgoing.push_back(OutgoingFriendRequest::new("carol"));
        assert_eq!(store.next_outgoing().username, "bob");
        assert_eq!(store.next_outgoing().username, "carol");
        assert_eq!(store.next_outgoing().username, "");
    }

    #[test]
    fn matching_requires_identity_and_dial_round() {
        let mut store = Store::default();
        store.incoming.push(incoming(identity(7), 5));

        assert_eq!(store.match_to_incoming(&sent("bob", identity(7), 5)), Some(0));
        assert_eq!(store.match_to_incoming(&sent("bob", identity(7), 6)), None);
        assert_eq!(store.match_to_incoming(&sent("bob", identity(8), 5)), None);
    }

    #[test]
    fn earliest_queued_sent_request_wins() {
        let mut store = Store::default();
        let mut first = sent("bob", identity(7), 5);
        first.sent_round = 1;
        let mut second = sent("bob", identity(7), 5);
        second.sent_round = 2;
        store.sent.push(first);
        store.sent.push(second);

        let hit = store.match_to_sent(&incoming(identity(7), 5)).unwrap();
        assert_eq!(store.sent[hit].sent_round, 1);
    }

    #[test]
    fn expired_sent_requests_are_dropped() {
        let mut store = Store::default();
        store.sent.push(sent("bob", identity(1), 5));
        store.sent.push(sent("carol", identity(2), 90));

        store.expire_sent(100, 10);
        assert_eq!(store.sent.len(), 1);
        assert_eq!(store.sent[0].username, "carol");
    }
}
