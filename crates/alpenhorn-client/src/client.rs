//! The client engine: state, lifecycle, and user-facing operations.
//!
//! One `Client` participates in both protocols at once. The coordinator
//! pushes typed envelopes over two websocket channels; every envelope is
//! dispatched onto its own task, and per-round state carries its own lock
//! so a slow mailbox scan for round `r` never blocks the announcement of
//! round `r+1`. The engine lock guards the round maps and queues and is
//! never held across I/O.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard,
        atomic::{AtomicU32, Ordering},
    },
};

use alpenhorn_crypto::{Keywheel, username_to_identity, valid_username_to_identity};
use alpenhorn_proto::{Envelope, SignedConfig, coordinator};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};

use crate::{
    addfriend::AddFriendRound,
    cdn::MailboxFetcher,
    config::{ConfigSource, ConfigVerifier},
    dialing::DialingRound,
    error::Error,
    event::{Event, EventHandler, EventSender, start_dispatcher},
    persist::{ExitHook, PersistHandle, STATE_VERSION, start_worker},
    pkg::PkgTransport,
    store::{Friend, IncomingFriendRequest, OutgoingCall, OutgoingFriendRequest, SentFriendRequest, Store},
    transport::{ConnSink, dial},
};

/// Rounds of state kept per protocol before garbage collection.
pub(crate) const ROUND_RETENTION: u32 = 10;

/// Dial-token slots emitted per dialing round, real or cover.
pub(crate) const NUM_DIAL_TOKENS: usize = 4;

/// Number of intent slots a call can be dialed under.
pub const INTENT_COUNT: u32 = 4;

/// Everything the engine needs at construction time.
pub struct ClientConfig {
    /// The user's username.
    pub username: String,
    /// The user's long-term ed25519 signing key.
    pub long_term_key: SigningKey,
    /// The ed25519 key authenticating the user to PKGs.
    pub pkg_login_key: SigningKey,
    /// Bootstrap trusted add-friend config.
    pub addfriend_config: SignedConfig,
    /// Bootstrap trusted dialing config.
    pub dialing_config: SignedConfig,
    /// Where the client state blob lives; `None` disables persistence.
    pub state_path: Option<PathBuf>,
    /// Where the keywheel blob lives. Kept apart from the state blob:
    /// the state is backup-eligible, the keywheel must never be.
    pub keywheel_path: Option<PathBuf>,
    /// Run just before the engine aborts on a persistence failure.
    pub exit_hook: Option<ExitHook>,
}

/// External collaborators, injected so tests can run fully in-memory.
pub struct Services {
    /// Config service, fetched by hash.
    pub config_source: Arc<dyn ConfigSource>,
    /// PKG endpoints.
    pub pkg_transport: Arc<dyn PkgTransport>,
    /// CDN mailbox downloads.
    pub mailbox_fetcher: Arc<dyn MailboxFetcher>,
}

/// Mix parameters a round needs again at mailbox-scan time.
#[derive(Clone, Copy)]
pub(crate) struct MixInfo {
    pub(crate) mailbox_key: [u8; 16],
    pub(crate) num_mailboxes: u32,
}

/// Per-protocol round map plus the currently trusted config.
pub(crate) struct ProtocolState<R> {
    pub(crate) rounds: HashMap<u32, Arc<R>>,
    pub(crate) config: SignedConfig,
    pub(crate) config_hash: String,
}

impl<R> ProtocolState<R> {
    fn new(config: SignedConfig) -> Self {
        let config_hash = config.hash();
        Self { rounds: HashMap::new(), config, config_hash }
    }

    /// Drop round state older than the retention window.
    pub(crate) fn collect_garbage(&mut self, current_round: u32) {
        self.rounds.retain(|&r, _| r.saturating_add(ROUND_RETENTION) >= current_round);
    }
}

/// State guarded by the engine lock.
pub(crate) struct EngineState {
    pub(crate) addfriend: ProtocolState<AddFriendRound>,
    pub(crate) dialing: ProtocolState<DialingRound>,
    pub(crate) store: Store,
    /// `hex(pkg key)|username` ids of completed PKG registrations.
    pub(crate) registrations: HashSet<String>,
    pub(crate) addfriend_conn: Option<Arc<dyn ConnSink>>,
    pub(crate) dialing_conn: Option<Arc<dyn ConnSink>>,
    pub(crate) connected: bool,
    pub(crate) tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Persisted form of the engine state.
#[derive(Serialize, Deserialize)]
struct StateBlob {
    username: String,
    addfriend_config: SignedConfig,
    dialing_config: SignedConfig,
    store: Store,
    registrations: HashSet<String>,
    last_dialing_round: u32,
}

pub(crate) struct ClientInner {
    pub(crate) username: String,
    pub(crate) long_term_key: SigningKey,
    pub(crate) pkg_login_key: SigningKey,
    pub(crate) state_path: Option<PathBuf>,
    pub(crate) keywheel_path: Option<PathBuf>,

    pub(crate) verifier: ConfigVerifier,
    pub(crate) pkg_transport: Arc<dyn PkgTransport>,
    pub(crate) mailbox_fetcher: Arc<dyn MailboxFetcher>,

    pub(crate) events: EventSender,
    pub(crate) persist: PersistHandle,
    /// Updated with release ordering by the dialing engine, read with
    /// acquire ordering when add-friend introductions are generated.
    pub(crate) last_dialing_round: AtomicU32,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) wheel: Mutex<Keywheel>,
}

/// The Alpenhorn client engine.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl ClientInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        // A poisoned engine lock means a handler panicked mid-update;
        // state integrity is gone, so propagate.
        #[allow(clippy::expect_used)]
        self.state.lock().expect("engine state lock poisoned")
    }

    pub(crate) fn lock_wheel(&self) -> MutexGuard<'_, Keywheel> {
        #[allow(clippy::expect_used)]
        self.wheel.lock().expect("keywheel lock poisoned")
    }

    /// Serialize and queue the state blob. Call with the lock held so the
    /// snapshot is consistent; the write itself happens on the worker.
    pub(crate) fn persist_state(&self, state: &EngineState) {
        let Some(path) = &self.state_path else {
            return;
        };
        let blob = StateBlob {
            username: self.username.clone(),
            addfriend_config: state.addfriend.config.clone(),
            dialing_config: state.dialing.config.clone(),
            store: state.store.clone(),
            registrations: state.registrations.clone(),
            last_dialing_round: self.last_dialing_round.load(Ordering::Acquire),
        };
        let mut bytes = vec![STATE_VERSION];
        // The blob is maps, vectors, and byte arrays; CBOR cannot fail.
        #[allow(clippy::expect_used)]
        ciborium::ser::into_writer(&blob, &mut bytes)
            .expect("state blob CBOR serialization is infallible");
        self.persist.write(path, bytes);
    }

    pub(crate) fn persist_keywheel(&self, wheel: &Keywheel) {
        let Some(path) = &self.keywheel_path else {
            return;
        };
        self.persist.write(path, wheel.marshal());
    }

    /// Create a friend from a paired (incoming, sent) request. Both sides
    /// must already be removed from their queues. Emits `ConfirmedFriend`.
    pub(crate) fn new_friend(&self, incoming: &IncomingFriendRequest, sent: &SentFriendRequest) {
        let username = sent.username.clone();
        let dh_secret = StaticSecret::from(sent.dh_private);
        let shared = dh_secret.diffie_hellman(&DhPublicKey::from(incoming.dh_public));

        let friend = Friend { username: username.clone(), long_term_key: incoming.long_term_key };

        {
            let mut wheel = self.lock_wheel();
            wheel.put(&username, incoming.dial_round, shared.to_bytes());
            self.persist_keywheel(&wheel);
        }
        {
            let mut state = self.lock_state();
            state.store.friends.insert(username, friend.clone());
            self.persist_state(&state);
        }

        self.events.emit(Event::ConfirmedFriend(friend));
    }

    /// Resolve a sender identity to a username we were already expecting.
    pub(crate) fn resolve_identity(&self, state: &EngineState, identity: &[u8; 32]) -> Option<String> {
        for sent in &state.store.sent {
            if &sent.target_identity == identity {
                return Some(sent.username.clone());
            }
        }
        for outgoing in &state.store.outgoing {
            if &valid_username_to_identity(&outgoing.username) == identity {
                return Some(outgoing.username.clone());
            }
        }
        for username in state.store.friends.keys() {
            if &valid_username_to_identity(username) == identity {
                return Some(username.clone());
            }
        }
        None
    }
}

impl Client {
    /// Create a client engine.
    ///
    /// Loads persisted state and keywheel from the configured paths when
    /// present; otherwise starts from the bootstrap configs. The handler
    /// receives events from a dedicated delivery task, strictly in order.
    pub fn new(
        config: ClientConfig,
        services: Services,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, Error> {
        username_to_identity(&config.username)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;

        let (mut addfriend_config, mut dialing_config) =
            (config.addfriend_config, config.dialing_config);
        let mut store = Store::default();
        let mut registrations = HashSet::new();
        let mut last_dialing_round = 0;

        if let Some(path) = &config.state_path {
            if let Ok(bytes) = std::fs::read(path) {
                let blob = decode_state_blob(&bytes)?;
                if blob.username != config.username {
                    return Err(Error::Internal(format!(
                        "state blob belongs to {:?}, not {:?}",
                        blob.username, config.username
                    )));
                }
                addfriend_config = blob.addfriend_config;
                dialing_config = blob.dialing_config;
                store = blob.store;
                registrations = blob.registrations;
                last_dialing_round = blob.last_dialing_round;
            }
        }

        let mut wheel = Keywheel::new();
        if let Some(path) = &config.keywheel_path {
            if let Ok(bytes) = std::fs::read(path) {
                wheel = Keywheel::unmarshal(&bytes)
                    .map_err(|e| Error::Internal(format!("keywheel blob: {e}")))?;
            }
        }

        // The dispatcher and persistence worker shut down on their own when
        // the engine drops their senders; queued events and writes drain
        // first, so neither task is tracked for abort.
        let (events, _dispatcher_task) = start_dispatcher(handler);
        let persist = if config.state_path.is_some() || config.keywheel_path.is_some() {
            let (handle, _persist_task) = start_worker(config.exit_hook);
            handle
        } else {
            PersistHandle::disabled()
        };

        let inner = Arc::new(ClientInner {
            username: config.username,
            long_term_key: config.long_term_key,
            pkg_login_key: config.pkg_login_key,
            state_path: config.state_path,
            keywheel_path: config.keywheel_path,
            verifier: ConfigVerifier::new(services.config_source),
            pkg_transport: services.pkg_transport,
            mailbox_fetcher: services.mailbox_fetcher,
            events,
            persist,
            last_dialing_round: AtomicU32::new(last_dialing_round),
            state: Mutex::new(EngineState {
                addfriend: ProtocolState::new(addfriend_config),
                dialing: ProtocolState::new(dialing_config),
                store,
                registrations,
                addfriend_conn: None,
                dialing_conn: None,
                connected: false,
                tasks: Vec::new(),
            }),
            wheel: Mutex::new(wheel),
        });

        Ok(Self { inner })
    }

    /// Connect to both coordinator endpoints and start processing rounds.
    pub async fn connect(&self) -> Result<(), Error> {
        let (addfriend_addr, dialing_addr) = {
            let state = self.inner.lock_state();
            if state.connected {
                return Err(Error::Internal("already connected".to_string()));
            }
            (
                state.addfriend.config.inner.coordinator().address.clone(),
                state.dialing.config.inner.coordinator().address.clone(),
            )
        };

        let (addfriend_tx, addfriend_rx) = mpsc::unbounded_channel();
        let addfriend_conn =
            dial(&format!("wss://{addfriend_addr}/addfriend/ws"), addfriend_tx).await?;

        let (dialing_tx, dialing_rx) = mpsc::unbounded_channel();
        let dialing_conn = match dial(&format!("wss://{dialing_addr}/dialing/ws"), dialing_tx).await
        {
            Ok(conn) => conn,
            Err(err) => {
                addfriend_conn.close();
                return Err(err);
            },
        };

        let pump_addfriend = self.spawn_pump(addfriend_rx, Protocol::AddFriend);
        let pump_dialing = self.spawn_pump(dialing_rx, Protocol::Dialing);

        let mut state = self.inner.lock_state();
        state.addfriend_conn = Some(Arc::new(addfriend_conn));
        state.dialing_conn = Some(Arc::new(dialing_conn));
        state.connected = true;
        state.tasks.push(pump_addfriend);
        state.tasks.push(pump_dialing);
        Ok(())
    }

    /// Attach pre-built envelope sinks instead of dialing websockets.
    ///
    /// This is the embedding seam the integration tests use: envelopes are
    /// then fed through [`Client::dispatch_addfriend`] and
    /// [`Client::dispatch_dialing`] directly.
    pub fn connect_local(&self, addfriend: Arc<dyn ConnSink>, dialing: Arc<dyn ConnSink>) {
        let mut state = self.inner.lock_state();
        state.addfriend_conn = Some(addfriend);
        state.dialing_conn = Some(dialing);
        state.connected = true;
    }

    fn spawn_pump(
        &self,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        protocol: Protocol,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let client = client.clone();
                // One task per envelope; per-round ordering is restored by
                // the round state's own lock.
                tokio::spawn(async move {
                    match protocol {
                        Protocol::AddFriend => client.dispatch_addfriend(envelope).await,
                        Protocol::Dialing => client.dispatch_dialing(envelope).await,
                    }
                });
            }
        })
    }

    /// Stop participating. In-flight network work is cancelled; events
    /// already queued to the application drain before delivery stops.
    pub async fn close(&self) {
        let tasks = {
            let mut state = self.inner.lock_state();
            state.connected = false;
            state.addfriend_conn = None;
            state.dialing_conn = None;
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            task.abort();
        }
    }

    /// Route an add-friend envelope to its handler.
    pub async fn dispatch_addfriend(&self, envelope: Envelope) {
        match envelope.id.as_str() {
            coordinator::MSG_NEW_ROUND => match envelope.open() {
                Ok(v) => self.inner.addfriend_new_round(v).await,
                Err(e) => self.inner.events.error(e.into()),
            },
            coordinator::MSG_PKG => match envelope.open() {
                Ok(v) => self.inner.extract_pkg_keys(v).await,
                Err(e) => self.inner.events.error(e.into()),
            },
            coordinator::MSG_MIX => match envelope.open() {
                Ok(v) => self.inner.send_addfriend_onion(v).await,
                Err(e) => self.inner.events.error(e.into()),
            },
            coordinator::MSG_MAILBOX => match envelope.open() {
                Ok(v) => self.inner.scan_addfriend_mailbox(v).await,
                Err(e) => self.inner.events.error(e.into()),
            },
            coordinator::MSG_ERROR => self.inner.round_error("addfriend", envelope),
            other => {
                tracing::debug!(id = other, "unknown add-friend envelope");
            },
        }
    }

    /// Route a dialing envelope to its handler.
    pub async fn dispatch_dialing(&self, envelope: Envelope) {
        match envelope.id.as_str() {
            coordinator::MSG_NEW_ROUND => match envelope.open() {
                Ok(v) => self.inner.dialing_new_round(v).await,
                Err(e) => self.inner.events.error(e.into()),
            },
            coordinator::MSG_MIX => match envelope.open() {
                Ok(v) => self.inner.send_dialing_onion(v).await,
                Err(e) => self.inner.events.error(e.into()),
            },
            coordinator::MSG_MAILBOX => match envelope.open() {
                Ok(v) => self.inner.scan_dialing_mailbox(v).await,
                Err(e) => self.inner.events.error(e.into()),
            },
            coordinator::MSG_ERROR => self.inner.round_error("dialing", envelope),
            other => {
                tracing::debug!(id = other, "unknown dialing envelope");
            },
        }
    }

    /// Queue a friend request to `username`.
    pub fn add_friend(&self, username: &str) -> Result<(), Error> {
        self.queue_request(OutgoingFriendRequest::new(username))
    }

    /// Queue a friend request that requires the target to present a
    /// specific long-term key.
    pub fn add_friend_with_expected_key(
        &self,
        username: &str,
        expected_key: [u8; 32],
    ) -> Result<(), Error> {
        let mut request = OutgoingFriendRequest::new(username);
        request.expected_key = Some(expected_key);
        self.queue_request(request)
    }

    fn queue_request(&self, request: OutgoingFriendRequest) -> Result<(), Error> {
        username_to_identity(&request.username)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        let mut state = self.inner.lock_state();
        state.store.outgoing.push_back(request);
        self.inner.persist_state(&state);
        Ok(())
    }

    /// Approve a received friend request, identifying the sender by the
    /// username the application knows them under. Queues a confirmation
    /// that pins the sender's long-term key and dial round.
    pub fn approve_friend_request(&self, username: &str) -> Result<(), Error> {
        let identity = username_to_identity(username)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;

        let mut state = self.inner.lock_state();
        let incoming = state
            .store
            .incoming
            .iter_mut()
            .find(|req| req.identity == identity)
            .ok_or_else(|| {
                Error::Internal(format!("no pending friend request from {username:?}"))
            })?;
        incoming.username = Some(username.to_string());

        let request = OutgoingFriendRequest {
            username: username.to_string(),
            expected_key: Some(incoming.long_term_key),
            confirmation: true,
            dial_round: Some(incoming.dial_round),
        };
        state.store.outgoing.push_back(request);
        self.inner.persist_state(&state);
        Ok(())
    }

    /// Discard a received friend request.
    pub fn reject_friend_request(&self, username: &str) -> Result<(), Error> {
        let identity = username_to_identity(username)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        let mut state = self.inner.lock_state();
        let before = state.store.incoming.len();
        state.store.incoming.retain(|req| req.identity != identity);
        if state.store.incoming.len() == before {
            return Err(Error::Internal(format!("no pending friend request from {username:?}")));
        }
        self.inner.persist_state(&state);
        Ok(())
    }

    /// Remove a friend and erase their keywheel chain.
    pub fn remove_friend(&self, username: &str) -> Result<(), Error> {
        {
            let mut state = self.inner.lock_state();
            if state.store.friends.remove(username).is_none() {
                return Err(Error::Internal(format!("no friend named {username:?}")));
            }
            self.inner.persist_state(&state);
        }
        let mut wheel = self.inner.lock_wheel();
        wheel.erase(username);
        self.inner.persist_keywheel(&wheel);
        Ok(())
    }

    /// Queue a call to a friend.
    pub fn call_friend(&self, username: &str, intent: u32) -> Result<(), Error> {
        if intent >= INTENT_COUNT {
            return Err(Error::Internal(format!(
                "intent {intent} out of range 0..{INTENT_COUNT}"
            )));
        }
        let mut state = self.inner.lock_state();
        if !state.store.friends.contains_key(username) {
            return Err(Error::Internal(format!("no friend named {username:?}")));
        }
        state
            .store
            .outgoing_calls
            .push_back(OutgoingCall { username: username.to_string(), intent });
        self.inner.persist_state(&state);
        Ok(())
    }

    /// Snapshot of confirmed friends.
    pub fn friends(&self) -> Vec<Friend> {
        let state = self.inner.lock_state();
        let mut friends: Vec<Friend> = state.store.friends.values().cloned().collect();
        friends.sort_by(|a, b| a.username.cmp(&b.username));
        friends
    }

    /// Snapshot of pending incoming friend requests.
    pub fn incoming_friend_requests(&self) -> Vec<IncomingFriendRequest> {
        self.inner.lock_state().store.incoming.clone()
    }

    /// Register with one PKG explicitly and record the registration.
    pub async fn register(&self, server: &alpenhorn_proto::ServerEntry) -> Result<(), Error> {
        let pkg = crate::pkg::PkgClient {
            server: server.clone(),
            username: &self.inner.username,
            login_key: &self.inner.pkg_login_key,
            long_term_key: self.inner.long_term_key.verifying_key().to_bytes(),
        };
        pkg.register(self.inner.pkg_transport.as_ref()).await?;

        let regid = format!("{}|{}", hex::encode(server.key), self.inner.username);
        let mut state = self.inner.lock_state();
        state.registrations.insert(regid);
        self.inner.persist_state(&state);
        Ok(())
    }

    /// Probe registration status on every PKG in the current add-friend
    /// config.
    pub async fn pkg_status(
        &self,
    ) -> Vec<(alpenhorn_proto::ServerEntry, Result<crate::pkg::RegistrationStatus, Error>)> {
        let servers: Vec<alpenhorn_proto::ServerEntry> = {
            let state = self.inner.lock_state();
            state.addfriend.config.inner.pkg_servers().to_vec()
        };

        let mut statuses = Vec::with_capacity(servers.len());
        for server in servers {
            let pkg = crate::pkg::PkgClient {
                server: server.clone(),
                username: &self.inner.username,
                login_key: &self.inner.pkg_login_key,
                long_term_key: self.inner.long_term_key.verifying_key().to_bytes(),
            };
            let status = pkg.check_status(self.inner.pkg_transport.as_ref()).await;
            statuses.push((server, status));
        }
        statuses
    }

    /// The most recent dialing round the engine has observed.
    pub fn last_dialing_round(&self) -> u32 {
        self.inner.last_dialing_round.load(Ordering::Acquire)
    }

    /// Number of add-friend rounds with live state.
    pub fn addfriend_round_count(&self) -> usize {
        self.inner.lock_state().addfriend.rounds.len()
    }

    /// Number of dialing rounds with live state.
    pub fn dialing_round_count(&self) -> usize {
        self.inner.lock_state().dialing.rounds.len()
    }
}

#[derive(Clone, Copy)]
enum Protocol {
    AddFriend,
    Dialing,
}

fn decode_state_blob(bytes: &[u8]) -> Result<StateBlob, Error> {
    let (&version, body) = bytes
        .split_first()
        .ok_or_else(|| Error::Internal("state blob is empty".to_string()))?;
    if version != STATE_VERSION {
        return Err(Error::Internal(format!("unsupported state blob version {version}")));
    }
    ciborium::de::from_reader(body).map_err(|e| Error::Internal(format!("state blob: {e}")))
}

impl ClientInner {
    fn round_error(&self, protocol: &str, envelope: Envelope) {
        match envelope.open::<coordinator::RoundError>() {
            Ok(err) => {
                tracing::error!(protocol, round = err.round, message = %err.message, "round error");
                self.events.error(Error::Internal(format!(
                    "{protocol} round {} failed: {}",
                    err.round, err.message
                )));
            },
            Err(e) => self.events.error(e.into()),
        }
    }
}
