//! The Alpenhorn client engine.
//!
//! Alpenhorn lets two users who know each other's usernames exchange an
//! initial key and schedule conversations without revealing to any server
//! or network observer who is contacting whom. This crate implements the
//! client side: the per-round state machines for the add-friend and
//! dialing protocols, PKG interaction, onion construction, mailbox
//! scanning, and the persistent friendship state around them.
//!
//! # Architecture
//!
//! The [`Client`] owns all round state and queues. The coordinator pushes
//! typed envelopes over two websocket channels; each envelope dispatches
//! onto its own task, with per-round locks restoring order inside a round
//! and the engine lock guarding the maps and queues. External services
//! (PKGs, the CDN, the config service) sit behind traits so the engine
//! runs unmodified against in-memory doubles in tests.
//!
//! # Unobservability
//!
//! The engine emits exactly one onion per round per protocol whether or
//! not the user has work queued. Cover traffic follows the same code path
//! as real traffic, with the real/cover difference applied by a
//! constant-time select over fixed-size buffers.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod addfriend;
mod cdn;
mod client;
mod config;
mod dialing;
mod error;
mod event;
mod persist;
mod pkg;
mod store;
mod transport;

pub use cdn::{HttpMailboxFetcher, MailboxFetcher};
pub use client::{Client, ClientConfig, INTENT_COUNT, Services};
pub use config::{ConfigSource, ConfigVerifier, HttpConfigSource};
pub use error::Error;
pub use event::{Event, EventHandler};
pub use persist::ExitHook;
pub use pkg::{
    ExtractArgs, ExtractReply, ExtractResult, HttpPkgTransport, PkgClient, PkgError, PkgErrorCode,
    PkgTransport, RegisterArgs, RegistrationStatus, StatusArgs,
};
pub use store::{
    Friend, IncomingFriendRequest, OutgoingCall, OutgoingFriendRequest, SentFriendRequest, Store,
};
pub use transport::{ConnSink, WsConn, dial};
