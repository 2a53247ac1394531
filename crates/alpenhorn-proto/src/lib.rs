//! Wire formats for the Alpenhorn client protocols.
//!
//! Everything that crosses a trust boundary is defined here: the JSON
//! envelopes spoken over the coordinator websocket, the fixed-layout
//! introduction that travels through the add-friend mixnet, the mix
//! messages themselves, and the signed configuration objects that root the
//! client's view of the system.
//!
//! This crate is pure data: encoding, decoding, signing messages, and size
//! constants. Pairing-based verification (IBE, BLS multisigs) lives in
//! `alpenhorn-crypto`; protocol state machines live in `alpenhorn-client`.
//!
//! # Invariants
//!
//! - Fixed-size types encode to exactly their declared byte count, real or
//!   cover. Cover traffic is indistinguishable by length.
//! - Round-trip encoding is the identity for every type in this crate.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod errors;
pub mod intro;
pub mod mix;

pub use config::{ConfigChainError, Guardian, InnerConfig, ServerEntry, SignedConfig};
pub use coordinator::{
    MailboxUrl, MixRound, MixSettings, NewRound, OnionMsg, PkgRound, PkgRoundInfo, PkgSettings,
    RoundError,
};
pub use envelope::Envelope;
pub use errors::WireError;
pub use intro::{Introduction, SIZE_INTRO};
pub use mix::{DialMessage, MixMessage, SIZE_DIAL_MESSAGE, SIZE_ENCRYPTED_INTRO, SIZE_MIX_MESSAGE};
