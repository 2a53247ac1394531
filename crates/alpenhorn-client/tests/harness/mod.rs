//! In-memory test world: PKGs, a mix chain, a CDN, and a config service,
//! wired to the engine through the same traits production uses.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use alpenhorn_client::{
    Client, ClientConfig, ConfigSource, ConnSink, Error, Event, EventHandler, ExtractArgs,
    ExtractReply, MailboxFetcher, PkgTransport, RegisterArgs, Services, StatusArgs,
};
use alpenhorn_crypto::{bloom::Filter, bls, ibe, onion, username_to_identity};
use alpenhorn_proto::{
    DialMessage, Envelope, Guardian, InnerConfig, MixMessage, ServerEntry, SignedConfig,
    coordinator::{
        MSG_MAILBOX, MSG_MIX, MSG_NEW_ROUND, MSG_PKG, MailboxUrl, MixRound, MixSettings, NewRound,
        OnionMsg, PkgRound, PkgRoundInfo, PkgSettings,
    },
    mix::{SIZE_DIAL_MESSAGE, SIZE_ENCRYPTED_INTRO},
};
use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use serde::Serialize;
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};

pub const NUM_MAILBOXES: u32 = 1;
pub const MAILBOX_KEY: [u8; 16] = [11u8; 16];

/// One PKG: an ed25519 identity, an IBE master share, a BLS attest key.
pub struct MockPkg {
    pub signing: SigningKey,
    pub master: ibe::MasterSecretKey,
    pub bls: bls::SecretKey,
    registered: Mutex<HashMap<String, [u8; 32]>>,
}

impl MockPkg {
    fn new() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            master: ibe::MasterSecretKey::generate(),
            bls: bls::SecretKey::generate(),
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn entry(&self, index: usize) -> ServerEntry {
        ServerEntry {
            key: self.signing.verifying_key().to_bytes(),
            address: format!("pkg{index}.test:443"),
        }
    }
}

/// One mixer: an ed25519 settings-signing key and an x25519 onion key.
pub struct Mixer {
    pub signing: SigningKey,
    pub onion_secret: StaticSecret,
}

impl Mixer {
    fn new() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            onion_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn onion_key(&self) -> [u8; 32] {
        DhPublicKey::from(&self.onion_secret).to_bytes()
    }

    pub fn entry(&self, index: usize) -> ServerEntry {
        ServerEntry {
            key: self.signing.verifying_key().to_bytes(),
            address: format!("mix{index}.test:443"),
        }
    }
}

/// Routes PKG requests to the mock PKG pinned by the server entry key.
pub struct WorldPkgTransport {
    pkgs: Vec<Arc<MockPkg>>,
}

impl WorldPkgTransport {
    fn pkg_for(&self, server: &ServerEntry) -> Result<&Arc<MockPkg>, Error> {
        self.pkgs
            .iter()
            .find(|pkg| pkg.signing.verifying_key().to_bytes() == server.key)
            .ok_or_else(|| Error::Transport(format!("no PKG at {}", server.address)))
    }
}

#[async_trait]
impl PkgTransport for WorldPkgTransport {
    async fn register(&self, server: &ServerEntry, args: RegisterArgs) -> Result<(), Error> {
        let pkg = self.pkg_for(server)?;
        let mut registered = pkg.registered.lock().unwrap();
        if registered.contains_key(&args.username) {
            return Err(Error::AlreadyRegistered);
        }
        registered.insert(args.username, args.long_term_key);
        Ok(())
    }

    async fn status(&self, server: &ServerEntry, args: StatusArgs) -> Result<(), Error> {
        let pkg = self.pkg_for(server)?;
        if pkg.registered.lock().unwrap().contains_key(&args.username) {
            Ok(())
        } else {
            Err(Error::NotRegistered)
        }
    }

    async fn extract(&self, server: &ServerEntry, args: ExtractArgs) -> Result<ExtractReply, Error> {
        let pkg = self.pkg_for(server)?;
        let long_term_key = pkg
            .registered
            .lock()
            .unwrap()
            .get(&args.username)
            .copied()
            .ok_or(Error::NotRegistered)?;

        let identity = username_to_identity(&args.username)
            .map_err(|e| Error::MalformedMessage(e.to_string()))?;
        let share = pkg.master.extract(&identity).to_compressed();
        let (sealed_share, _) = onion::seal(&share, &[args.return_key]);

        let attest_msg =
            bls::attestation_message(&pkg.bls.public_key(), &identity, &long_term_key);
        Ok(ExtractReply {
            round: args.round,
            sealed_share,
            attestation: pkg.bls.sign(&attest_msg).to_compressed(),
        })
    }
}

/// In-memory CDN keyed by (url, mailbox).
#[derive(Default)]
pub struct MemoryCdn {
    mailboxes: Mutex<HashMap<(String, u64), Vec<u8>>>,
}

impl MemoryCdn {
    pub fn put(&self, url: &str, mailbox: u64, data: Vec<u8>) {
        self.mailboxes.lock().unwrap().insert((url.to_string(), mailbox), data);
    }
}

#[async_trait]
impl MailboxFetcher for MemoryCdn {
    async fn fetch(
        &self,
        _cdn: &ServerEntry,
        base_url: &str,
        mailbox: u64,
    ) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.mailboxes.lock().unwrap().get(&(base_url.to_string(), mailbox)).cloned())
    }
}

/// Config service holding signed configs by hash.
#[derive(Default)]
pub struct MemoryConfigSource {
    configs: Mutex<HashMap<String, SignedConfig>>,
}

impl MemoryConfigSource {
    pub fn publish(&self, config: &SignedConfig) {
        self.configs.lock().unwrap().insert(config.hash(), config.clone());
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn fetch(&self, hash: &str) -> Result<Option<SignedConfig>, Error> {
        Ok(self.configs.lock().unwrap().get(hash).cloned())
    }
}

/// Captures the onions a client emits.
#[derive(Default)]
pub struct CollectingSink {
    envelopes: Mutex<Vec<Envelope>>,
}

impl CollectingSink {
    pub fn drain_onions(&self) -> Vec<OnionMsg> {
        self.envelopes
            .lock()
            .unwrap()
            .drain(..)
            .filter_map(|env| env.open::<OnionMsg>().ok())
            .collect()
    }
}

impl ConnSink for CollectingSink {
    fn send(&self, envelope: Envelope) -> Result<(), Error> {
        self.envelopes.lock().unwrap().push(envelope);
        Ok(())
    }
}

/// Records events for assertions.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Wait until an event matching `pred` has been delivered.
    pub async fn wait_for(&self, pred: impl Fn(&Event) -> bool) -> Event {
        for _ in 0..500 {
            if let Some(event) = self.events.lock().unwrap().iter().find(|e| pred(e)) {
                return event.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for event; got {:?}", self.snapshot());
    }

    /// Wait long enough for queued deliveries to land, then assert none
    /// match.
    pub async fn assert_never(&self, pred: impl Fn(&Event) -> bool) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !self.events.lock().unwrap().iter().any(|e| pred(e)),
            "unexpected event in {:?}",
            self.snapshot()
        );
    }
}

impl EventHandler for RecordingHandler {
    fn on_event(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// The full test world.
pub struct World {
    pub pkgs: Vec<Arc<MockPkg>>,
    pub mixers: Vec<Mixer>,
    pub addfriend_config: SignedConfig,
    pub dialing_config: SignedConfig,
    pub cdn: Arc<MemoryCdn>,
    pub pkg_transport: Arc<WorldPkgTransport>,
    pub config_source: Arc<MemoryConfigSource>,
    pub guardian: SigningKey,
}

static TRACING: std::sync::Once = std::sync::Once::new();

impl World {
    pub fn new(num_pkgs: usize, num_mixers: usize) -> Self {
        TRACING.call_once(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });

        let pkgs: Vec<Arc<MockPkg>> = (0..num_pkgs).map(|_| Arc::new(MockPkg::new())).collect();
        let mixers: Vec<Mixer> = (0..num_mixers).map(|_| Mixer::new()).collect();
        let guardian = SigningKey::generate(&mut OsRng);

        let coordinator = ServerEntry { key: [1u8; 32], address: "coordinator.test:443".into() };
        let cdn_entry = ServerEntry { key: [2u8; 32], address: "cdn.test:443".into() };

        let guardians = vec![Guardian {
            username: "guardian".to_string(),
            key: guardian.verifying_key().to_bytes(),
        }];

        let addfriend_config = SignedConfig {
            version: 1,
            service: "AddFriend".to_string(),
            created: 1000,
            expires: u64::MAX,
            prev_config_hash: String::new(),
            inner: InnerConfig::AddFriend {
                coordinator: coordinator.clone(),
                pkg_servers: pkgs.iter().enumerate().map(|(i, p)| p.entry(i)).collect(),
                mix_servers: mixers.iter().enumerate().map(|(i, m)| m.entry(i)).collect(),
                cdn: cdn_entry.clone(),
            },
            guardians: guardians.clone(),
            guardian_threshold: 1,
            signatures: Default::default(),
        };

        let dialing_config = SignedConfig {
            version: 1,
            service: "Dialing".to_string(),
            created: 1000,
            expires: u64::MAX,
            prev_config_hash: String::new(),
            inner: InnerConfig::Dialing {
                coordinator,
                mix_servers: mixers.iter().enumerate().map(|(i, m)| m.entry(i)).collect(),
                cdn: cdn_entry,
            },
            guardians,
            guardian_threshold: 1,
            signatures: Default::default(),
        };

        let pkg_transport = Arc::new(WorldPkgTransport { pkgs: pkgs.clone() });
        Self {
            pkgs,
            mixers,
            addfriend_config,
            dialing_config,
            cdn: Arc::new(MemoryCdn::default()),
            pkg_transport,
            config_source: Arc::new(MemoryConfigSource::default()),
            guardian,
        }
    }

    pub fn services(&self) -> Services {
        Services {
            config_source: self.config_source.clone(),
            pkg_transport: self.pkg_transport.clone(),
            mailbox_fetcher: self.cdn.clone(),
        }
    }

    /// Build a client with a fresh handler and sinks, registered with
    /// every PKG and attached to in-memory connections.
    pub async fn client(&self, username: &str) -> TestClient {
        self.client_with_paths(username, None, None).await
    }

    pub async fn client_with_paths(
        &self,
        username: &str,
        state_path: Option<std::path::PathBuf>,
        keywheel_path: Option<std::path::PathBuf>,
    ) -> TestClient {
        let handler = Arc::new(RecordingHandler::default());
        let client = Client::new(
            ClientConfig {
                username: username.to_string(),
                long_term_key: SigningKey::generate(&mut OsRng),
                pkg_login_key: SigningKey::generate(&mut OsRng),
                addfriend_config: self.addfriend_config.clone(),
                dialing_config: self.dialing_config.clone(),
                state_path,
                keywheel_path,
                exit_hook: None,
            },
            self.services(),
            handler.clone(),
        )
        .expect("client construction");

        let addfriend_sink = Arc::new(CollectingSink::default());
        let dialing_sink = Arc::new(CollectingSink::default());
        client.connect_local(addfriend_sink.clone(), dialing_sink.clone());

        for (i, pkg) in self.pkgs.iter().enumerate() {
            client.register(&pkg.entry(i)).await.expect("pkg registration");
        }

        TestClient { client, handler, addfriend_sink, dialing_sink }
    }

    pub fn pkg_settings(&self, round: u32) -> PkgSettings {
        let mut settings = PkgSettings::default();
        for pkg in &self.pkgs {
            let mut info = PkgRoundInfo {
                master_public_key: pkg.master.public_key().to_compressed(),
                bls_public_key: pkg.bls.public_key().to_compressed(),
                signature: [0u8; 64],
            };
            // Mirror the settings binding the client verifies.
            let mut msg = b"AlpenhornPKGSettings".to_vec();
            msg.extend_from_slice(&round.to_le_bytes());
            msg.extend_from_slice(&info.master_public_key);
            msg.extend_from_slice(&info.bls_public_key);
            info.signature = pkg.signing.sign(&msg).to_bytes();
            settings.0.insert(hex::encode(pkg.signing.verifying_key().to_bytes()), info);
        }
        settings
    }

    pub fn mix_round(&self, service: &str, round: u32) -> MixRound {
        let settings = MixSettings {
            service: service.to_string(),
            round,
            num_mailboxes: NUM_MAILBOXES,
            mailbox_key: MAILBOX_KEY,
            onion_keys: self.mixers.iter().map(Mixer::onion_key).collect(),
        };
        let message = settings.signing_message();
        let signatures = self.mixers.iter().map(|m| m.signing.sign(&message).to_bytes()).collect();
        MixRound { mix_settings: settings, mix_signatures: signatures }
    }

    fn peel_all(&self, onion: &[u8]) -> Option<Vec<u8>> {
        let mut current = onion.to_vec();
        for mixer in &self.mixers {
            let (inner, _) = onion::peel(&current, &mixer.onion_secret)?;
            current = inner;
        }
        Some(current)
    }

    /// Run the add-friend mixnet over collected onions and publish the
    /// resulting mailboxes to the CDN.
    pub fn run_addfriend_mix(&self, round: u32, onions: &[OnionMsg]) -> String {
        let mut mailboxes: HashMap<u64, Vec<u8>> = HashMap::new();
        for onion in onions {
            let Some(payload) = self.peel_all(&onion.onion) else {
                panic!("onion failed to peel");
            };
            let message = MixMessage::decode(&payload).expect("mix message decodes");
            assert_eq!(message.encrypted_intro.len(), SIZE_ENCRYPTED_INTRO);
            if message.mailbox < u64::from(NUM_MAILBOXES) {
                mailboxes.entry(message.mailbox).or_default().extend_from_slice(
                    &message.encrypted_intro,
                );
            }
            // Cover traffic addresses the sentinel bucket and is dropped.
        }

        let url = format!("/addfriend/{round}");
        for (mailbox, data) in mailboxes {
            self.cdn.put(&url, mailbox, data);
        }
        self.cdn.put(&url, u64::from(NUM_MAILBOXES), Vec::new());
        url
    }

    /// Run the dialing mixnet: route tokens into per-mailbox bloom
    /// filters and publish them.
    pub fn run_dialing_mix(&self, round: u32, onions: &[OnionMsg]) -> String {
        let mut tokens: HashMap<u64, Vec<[u8; 32]>> = HashMap::new();
        for onion in onions {
            let Some(payload) = self.peel_all(&onion.onion) else {
                panic!("dial onion failed to peel");
            };
            assert_eq!(payload.len() % SIZE_DIAL_MESSAGE, 0);
            for chunk in payload.chunks_exact(SIZE_DIAL_MESSAGE) {
                let message = DialMessage::decode(chunk).expect("dial message decodes");
                if message.mailbox < u64::from(NUM_MAILBOXES) {
                    tokens.entry(message.mailbox).or_default().push(message.token);
                }
            }
        }

        let url = format!("/dialing/{round}");
        for mailbox in 0..u64::from(NUM_MAILBOXES) {
            let entries = tokens.remove(&mailbox).unwrap_or_default();
            let (bits, hashes) = Filter::optimal(entries.len().max(16), 1e-10);
            let mut filter = Filter::new(bits, hashes);
            for token in entries {
                filter.set(&token);
            }
            self.cdn.put(&url, mailbox, filter.marshal());
        }
        url
    }
}

/// A client plus its recorded events and captured onions.
pub struct TestClient {
    pub client: Client,
    pub handler: Arc<RecordingHandler>,
    pub addfriend_sink: Arc<CollectingSink>,
    pub dialing_sink: Arc<CollectingSink>,
}

pub fn envelope(id: &str, message: &impl Serialize) -> Envelope {
    Envelope::new(id, message).expect("envelope encodes")
}

/// Drive one complete add-friend round for all clients and return each
/// client's emitted onion, in client order.
pub async fn run_addfriend_round(world: &World, round: u32, clients: &[&TestClient]) -> Vec<OnionMsg> {
    let hash = world.addfriend_config.hash();
    for tc in clients {
        tc.client
            .dispatch_addfriend(envelope(
                MSG_NEW_ROUND,
                &NewRound { round, config_hash: hash.clone() },
            ))
            .await;
    }

    let pkg_round = PkgRound { round, pkg_settings: world.pkg_settings(round) };
    for tc in clients {
        tc.client.dispatch_addfriend(envelope(MSG_PKG, &pkg_round)).await;
    }

    let mix = world.mix_round("AddFriend", round);
    for tc in clients {
        tc.client.dispatch_addfriend(envelope(MSG_MIX, &mix)).await;
    }

    let mut onions = Vec::new();
    for tc in clients {
        let mut emitted = tc.addfriend_sink.drain_onions();
        assert_eq!(emitted.len(), 1, "exactly one onion per round per client");
        onions.push(emitted.remove(0));
    }

    let url = world.run_addfriend_mix(round, &onions);
    let announcement = MailboxUrl { round, url, num_mailboxes: NUM_MAILBOXES };
    for tc in clients {
        tc.client.dispatch_addfriend(envelope(MSG_MAILBOX, &announcement)).await;
    }

    onions
}

/// Drive one complete dialing round for all clients.
pub async fn run_dialing_round(world: &World, round: u32, clients: &[&TestClient]) -> Vec<OnionMsg> {
    let hash = world.dialing_config.hash();
    for tc in clients {
        tc.client
            .dispatch_dialing(envelope(
                MSG_NEW_ROUND,
                &NewRound { round, config_hash: hash.clone() },
            ))
            .await;
    }

    let mix = world.mix_round("Dialing", round);
    for tc in clients {
        tc.client.dispatch_dialing(envelope(MSG_MIX, &mix)).await;
    }

    let mut onions = Vec::new();
    for tc in clients {
        let mut emitted = tc.dialing_sink.drain_onions();
        assert_eq!(emitted.len(), 1, "exactly one dialing onion per round per client");
        onions.push(emitted.remove(0));
    }

    let url = world.run_dialing_mix(round, &onions);
    let announcement = MailboxUrl { round, url, num_mailboxes: NUM_MAILBOXES };
    for tc in clients {
        tc.client.dispatch_dialing(envelope(MSG_MAILBOX, &announcement)).await;
    }

    onions
}
