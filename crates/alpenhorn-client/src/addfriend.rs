//! The add-friend round engine.
//!
//! Four phases per round, driven by coordinator envelopes: `newround`
//! installs the round and catches up on config changes, `pkg` extracts the
//! per-round IBE key shares and attestations from every PKG, `mix` emits
//! exactly one onion (real or cover), and `mailbox` scans the client's
//! bucket for introductions addressed to it.
//!
//! The cover-traffic discipline runs through everything here: an idle
//! client synthesizes a request to the empty username and then performs
//! the identical sequence of operations a real request performs, with the
//! real/cover difference applied only by a constant-time select over a
//! fixed-size buffer and by the out-of-range cover mailbox.

use std::sync::{Arc, atomic::Ordering};

use alpenhorn_crypto::{bls, ibe, onion, mailbox::mailbox, valid_username_to_identity};
use alpenhorn_proto::{
    Envelope, Introduction, MixMessage, SIZE_ENCRYPTED_INTRO, SignedConfig,
    coordinator::{self, MailboxUrl, MixRound, NewRound, PkgRound},
};
use ed25519_dalek::{Signature as EdSignature, VerifyingKey};
use rand::rngs::OsRng;
use subtle::{Choice, ConditionallySelectable};
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};

use crate::{
    client::{ClientInner, MixInfo},
    error::Error,
    event::Event,
    pkg::PkgClient,
    store::{IncomingFriendRequest, OutgoingFriendRequest, SentFriendRequest},
};

/// Per-round state for the add-friend protocol.
pub(crate) struct AddFriendRound {
    pub(crate) round: u32,
    pub(crate) config: SignedConfig,
    /// Phase data, serialized per round by this lock so a slow phase in
    /// one round never blocks another round's dispatch.
    pub(crate) phase: tokio::sync::Mutex<AddFriendPhase>,
}

impl AddFriendRound {
    pub(crate) fn new(round: u32, config: SignedConfig) -> Self {
        Self { round, config, phase: tokio::sync::Mutex::new(AddFriendPhase::default()) }
    }
}

/// What the round has accumulated so far.
#[derive(Default)]
pub(crate) struct AddFriendPhase {
    pub(crate) keys: Option<AddFriendKeys>,
    /// Set once the round's onion has been sent; also carries the mix
    /// parameters the mailbox scan needs.
    pub(crate) mix: Option<MixInfo>,
}

/// Key material extracted from every PKG for one round, index-aligned
/// with the config's PKG list.
#[derive(Clone)]
pub(crate) struct AddFriendKeys {
    pub(crate) master_keys: Vec<ibe::MasterPublicKey>,
    pub(crate) private_shares: Vec<ibe::IdentityPrivateKey>,
    pub(crate) bls_keys: Vec<bls::PublicKey>,
    pub(crate) attestations: Vec<bls::Signature>,
}

/// Copy `real` into `dst` when `is_real`, leave `dst` zeroed otherwise.
///
/// Both paths touch every byte exactly once; the branch-free select is
/// what keeps a cover round's memory trace identical to a real one's.
fn constant_time_copy(is_real: bool, dst: &mut [u8; SIZE_ENCRYPTED_INTRO], real: &[u8]) {
    debug_assert_eq!(real.len(), dst.len());
    let choice = Choice::from(u8::from(is_real));
    for (d, r) in dst.iter_mut().zip(real) {
        *d = u8::conditional_select(d, r, choice);
    }
}

impl ClientInner {
    /// `newround`: install round state, catching up on config changes.
    pub(crate) async fn addfriend_new_round(&self, v: NewRound) {
        let trusted = {
            let mut state = self.lock_state();
            if let Some(existing) = state.addfriend.rounds.get(&v.round) {
                if existing.config.hash() != v.config_hash {
                    self.events.error(Error::Internal(format!(
                        "coordinator announced different configs for add-friend round {}",
                        v.round
                    )));
                }
                return;
            }
            if v.config_hash == state.addfriend.config_hash {
                let config = state.addfriend.config.clone();
                state
                    .addfriend
                    .rounds
                    .insert(v.round, Arc::new(AddFriendRound::new(v.round, config)));
                state.addfriend.collect_garbage(v.round);
                return;
            }
            state.addfriend.config.clone()
        };

        let chain = match self.verifier.fetch_and_verify(&trusted, &v.config_hash).await {
            Ok(chain) => chain,
            Err(err) => {
                self.events.error(err);
                return;
            },
        };
        let Some(new_config) = chain.first().cloned() else {
            // The trusted config caught up underneath us; retry the fast path.
            let mut state = self.lock_state();
            if v.config_hash == state.addfriend.config_hash
                && !state.addfriend.rounds.contains_key(&v.round)
            {
                let config = state.addfriend.config.clone();
                state
                    .addfriend
                    .rounds
                    .insert(v.round, Arc::new(AddFriendRound::new(v.round, config)));
                state.addfriend.collect_garbage(v.round);
            }
            return;
        };

        {
            let mut state = self.lock_state();
            if let Some(existing) = state.addfriend.rounds.get(&v.round) {
                if existing.config.hash() != v.config_hash {
                    self.events.error(Error::Internal(format!(
                        "coordinator announced different configs for add-friend round {}",
                        v.round
                    )));
                }
            } else {
                state
                    .addfriend
                    .rounds
                    .insert(v.round, Arc::new(AddFriendRound::new(v.round, new_config.clone())));
                state.addfriend.collect_garbage(v.round);
            }
            state.addfriend.config = new_config.clone();
            state.addfriend.config_hash = v.config_hash.clone();
            self.persist_state(&state);
        }

        self.events.emit(Event::NewConfig { service: "AddFriend".to_string(), chain });
        self.register_new_pkgs(&new_config).await;
    }

    /// Register with any PKG in `config` we have no registration for.
    /// Idempotent; a PKG that copied our registration from a predecessor
    /// just gets recorded.
    async fn register_new_pkgs(&self, config: &SignedConfig) {
        let long_term_key = self.long_term_key.verifying_key().to_bytes();

        for server in config.inner.pkg_servers() {
            let regid = format!("{}|{}", hex::encode(server.key), self.username);
            if self.lock_state().registrations.contains(&regid) {
                continue;
            }

            let pkg = PkgClient {
                server: server.clone(),
                username: &self.username,
                login_key: &self.pkg_login_key,
                long_term_key,
            };

            let outcome = match pkg.check_status(self.pkg_transport.as_ref()).await {
                Ok(crate::pkg::RegistrationStatus::NotRegistered) => {
                    pkg.register(self.pkg_transport.as_ref()).await
                },
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(pkg = %server.address, "registered with new PKG");
                    let mut state = self.lock_state();
                    state.registrations.insert(regid);
                    self.persist_state(&state);
                },
                Err(err) => {
                    tracing::warn!(pkg = %server.address, error = %err, "PKG registration failed");
                    self.events.error(err);
                },
            }
        }
    }

    /// `pkg`: extract per-round key shares from every PKG.
    pub(crate) async fn extract_pkg_keys(&self, v: PkgRound) {
        let round_state = self.lock_state().addfriend.rounds.get(&v.round).cloned();
        let Some(round_state) = round_state else {
            self.events
                .error(Error::Internal(format!("pkg keys: round {} not configured", v.round)));
            return;
        };

        let mut phase = round_state.phase.lock().await;
        if phase.keys.is_some() {
            return;
        }

        let pkg_servers = round_state.config.inner.pkg_servers().to_vec();
        let pkg_keys: Vec<[u8; 32]> = pkg_servers.iter().map(|s| s.key).collect();
        if !v.pkg_settings.verify(v.round, &pkg_keys) {
            self.events.error(Error::InvalidSignature(format!(
                "round {}: failed to verify PKG settings",
                v.round
            )));
            return;
        }

        let identity = valid_username_to_identity(&self.username);
        let long_term_key = self.long_term_key.verifying_key().to_bytes();

        let mut keys = AddFriendKeys {
            master_keys: Vec::with_capacity(pkg_servers.len()),
            private_shares: Vec::with_capacity(pkg_servers.len()),
            bls_keys: Vec::with_capacity(pkg_servers.len()),
            attestations: Vec::with_capacity(pkg_servers.len()),
        };

        for server in &pkg_servers {
            let regid = format!("{}|{}", hex::encode(server.key), self.username);
            if !self.lock_state().registrations.contains(&regid) {
                self.events.error(Error::NotRegistered);
                return;
            }

            // Settings verified above, so the entry exists and is signed.
            let Some(info) = v.pkg_settings.get(&server.key) else {
                return;
            };
            let Some(master) = ibe::MasterPublicKey::from_compressed(&info.master_public_key)
            else {
                self.events.error(Error::MalformedMessage(format!(
                    "PKG {} published a malformed master key",
                    server.address
                )));
                return;
            };
            let Some(bls_key) = bls::PublicKey::from_compressed(&info.bls_public_key) else {
                self.events.error(Error::MalformedMessage(format!(
                    "PKG {} published a malformed attestation key",
                    server.address
                )));
                return;
            };

            let pkg = PkgClient {
                server: server.clone(),
                username: &self.username,
                login_key: &self.pkg_login_key,
                long_term_key,
            };
            let extracted = match pkg.extract(self.pkg_transport.as_ref(), v.round).await {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(pkg = %server.address, round = v.round, error = %err,
                        "PKG key extraction failed");
                    self.events.error(err);
                    return;
                },
            };

            // An invalid attestation is an untrusted-input failure: log it
            // and drop the round, but emit no error traffic.
            let attest_msg = bls::attestation_message(&bls_key, &identity, &long_term_key);
            if !bls::verify(&[bls_key], &attest_msg, &extracted.attestation) {
                tracing::error!(pkg = %server.address, "PKG returned an invalid identity attestation");
                return;
            }

            keys.master_keys.push(master);
            keys.bls_keys.push(bls_key);
            keys.private_shares.push(extracted.private_key_share);
            keys.attestations.push(extracted.attestation);
        }

        phase.keys = Some(keys);
    }

    /// `mix`: emit the round's one onion, real or cover.
    pub(crate) async fn send_addfriend_onion(&self, v: MixRound) {
        let round = v.mix_settings.round;
        if v.mix_settings.service != "AddFriend" {
            self.events.error(Error::MalformedMessage(format!(
                "add-friend channel got mix settings for {:?}",
                v.mix_settings.service
            )));
            return;
        }

        let round_state = self.lock_state().addfriend.rounds.get(&round).cloned();
        let Some(round_state) = round_state else {
            self.events
                .error(Error::Internal(format!("send onion: round {round} not configured")));
            return;
        };
        debug_assert_eq!(round_state.round, round);

        if !self.verify_mix_signatures(&round_state.config, &v) {
            return;
        }

        let mut phase = round_state.phase.lock().await;
        if phase.mix.is_some() {
            return;
        }
        let Some(keys) = phase.keys.as_ref() else {
            self.events
                .error(Error::Internal(format!("send onion: round {round} has no PKG keys")));
            return;
        };

        let outgoing = self.lock_state().store.next_outgoing();
        let (intro, sent) = self.generate_introduction(round, keys, &outgoing);
        let is_real = !sent.username.is_empty();

        // Every step below runs identically for cover requests: hash the
        // (possibly empty) username, encrypt, select, seal.
        let master = ibe::MasterPublicKey::aggregate(&keys.master_keys);
        let encrypted =
            ibe::encrypt(&mut OsRng, &master, &sent.target_identity, &intro.encode());

        let mut payload = [0u8; SIZE_ENCRYPTED_INTRO];
        constant_time_copy(is_real, &mut payload, &encrypted);

        let message = MixMessage {
            mailbox: mailbox(
                &sent.username,
                &v.mix_settings.mailbox_key,
                v.mix_settings.num_mailboxes,
            ),
            encrypted_intro: payload,
        };
        let (sealed, _reply_keys) = onion::seal(&message.encode(), &v.mix_settings.onion_keys);

        if !self.send_onion(round, sealed, true) {
            return;
        }
        phase.mix = Some(MixInfo {
            mailbox_key: v.mix_settings.mailbox_key,
            num_mailboxes: v.mix_settings.num_mailboxes,
        });
        drop(phase);

        if is_real {
            self.events.emit(Event::SentFriendRequest(outgoing));
            let matched = {
                let mut state = self.lock_state();
                match state.store.match_to_incoming(&sent) {
                    Some(i) => {
                        let mut incoming = state.store.incoming.remove(i);
                        incoming.username = Some(sent.username.clone());
                        self.persist_state(&state);
                        Some(incoming)
                    },
                    None => {
                        state.store.sent.push(sent.clone());
                        self.persist_state(&state);
                        None
                    },
                }
            };
            if let Some(incoming) = matched {
                self.complete_match(incoming, sent);
            }
        }
    }

    pub(crate) fn verify_mix_signatures(&self, config: &SignedConfig, v: &MixRound) -> bool {
        let message = v.mix_settings.signing_message();
        let mixers = config.inner.mix_servers();
        if v.mix_signatures.len() != mixers.len() {
            self.events.error(Error::InvalidSignature(format!(
                "round {}: got {} mixnet signatures for {} mixers",
                v.mix_settings.round,
                v.mix_signatures.len(),
                mixers.len()
            )));
            return false;
        }
        for (mixer, sig) in mixers.iter().zip(&v.mix_signatures) {
            let Ok(key) = VerifyingKey::from_bytes(&mixer.key) else {
                self.events.error(Error::InvalidSignature(format!(
                    "round {}: mixer {} has an invalid key",
                    v.mix_settings.round, mixer.address
                )));
                return false;
            };
            if key.verify_strict(&message, &EdSignature::from_bytes(sig)).is_err() {
                self.events.error(Error::InvalidSignature(format!(
                    "round {}: failed to verify mixnet settings for {}",
                    v.mix_settings.round, mixer.address
                )));
                return false;
            }
        }
        true
    }

    /// Build the introduction and its private half from a request.
    fn generate_introduction(
        &self,
        round: u32,
        keys: &AddFriendKeys,
        outgoing: &OutgoingFriendRequest,
    ) -> (Introduction, SentFriendRequest) {
        let dh_secret = StaticSecret::random_from_rng(OsRng);
        let dh_public = DhPublicKey::from(&dh_secret).to_bytes();

        // Confirmations pin the dial round the other side proposed; new
        // requests snapshot the latest dialing round we have observed.
        let dial_round = match (outgoing.confirmation, outgoing.dial_round) {
            (true, Some(r)) => r,
            _ => self.last_dialing_round.load(Ordering::Acquire),
        };

        let sent = SentFriendRequest {
            username: outgoing.username.clone(),
            target_identity: valid_username_to_identity(&outgoing.username),
            expected_key: outgoing.expected_key,
            confirmation: outgoing.confirmation,
            dial_round,
            sent_round: round,
            dh_public,
            dh_private: dh_secret.to_bytes(),
        };

        let mut intro = Introduction {
            identity: valid_username_to_identity(&self.username),
            long_term_key: self.long_term_key.verifying_key().to_bytes(),
            dh_public,
            dialing_round: dial_round,
            server_multisig: bls::aggregate(&keys.attestations).to_compressed(),
            signature: [0u8; 64],
        };
        intro.sign(&self.long_term_key);

        (intro, sent)
    }

    /// Send one onion on a protocol channel. Reports failures as events.
    pub(crate) fn send_onion(&self, round: u32, onion: Vec<u8>, addfriend: bool) -> bool {
        let conn = {
            let state = self.lock_state();
            if addfriend { state.addfriend_conn.clone() } else { state.dialing_conn.clone() }
        };
        let Some(conn) = conn else {
            self.events.error(Error::Transport("not connected to coordinator".to_string()));
            return false;
        };
        let envelope = match Envelope::new(
            coordinator::MSG_ONION,
            &coordinator::OnionMsg { round, onion },
        ) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.events.error(err.into());
                return false;
            },
        };
        if let Err(err) = conn.send(envelope) {
            self.events.error(err);
            return false;
        }
        true
    }

    /// `mailbox`: fetch our bucket and scan it for introductions.
    pub(crate) async fn scan_addfriend_mailbox(&self, v: MailboxUrl) {
        let round_state = self.lock_state().addfriend.rounds.get(&v.round).cloned();
        let Some(round_state) = round_state else {
            // A mailbox for a round we never configured; the round is lost.
            return;
        };

        let (keys, mix_info) = {
            let phase = round_state.phase.lock().await;
            let (Some(keys), Some(mix_info)) = (phase.keys.clone(), phase.mix) else {
                return;
            };
            (keys, mix_info)
        };

        let mailbox_id = mailbox(&self.username, &mix_info.mailbox_key, v.num_mailboxes);
        let cdn = round_state.config.inner.cdn().clone();
        let data = match self.mailbox_fetcher.fetch(&cdn, &v.url, mailbox_id).await {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(err) => {
                self.events.error(Error::Transport(format!("fetching mailbox: {err}")));
                return;
            },
        };

        let private_key = ibe::IdentityPrivateKey::aggregate(&keys.private_shares);
        let decrypted = decrypt_spans(private_key, data).await;
        for plaintext in decrypted {
            self.decode_addfriend_message(&plaintext, &keys.bls_keys);
        }
    }

    /// Parse, verify, and file one decrypted introduction.
    ///
    /// Anything that fails verification is dropped without a trace beyond
    /// a log line; mailbox contents are attacker-writable.
    fn decode_addfriend_message(&self, plaintext: &[u8], bls_keys: &[bls::PublicKey]) {
        let Ok(intro) = Introduction::decode(plaintext) else {
            return;
        };

        let Some(multisig) = bls::Signature::from_compressed(&intro.server_multisig) else {
            return;
        };
        let attest_msgs: Vec<Vec<u8>> = bls_keys
            .iter()
            .map(|key| bls::attestation_message(key, &intro.identity, &intro.long_term_key))
            .collect();
        if !bls::verify_multi(bls_keys, &attest_msgs, &multisig) {
            tracing::warn!("dropping introduction with an invalid server multisig");
            return;
        }
        if !intro.verify_signature() {
            tracing::warn!("dropping introduction with an invalid self-signature");
            return;
        }

        let mut incoming = IncomingFriendRequest {
            identity: intro.identity,
            username: None,
            long_term_key: intro.long_term_key,
            dh_public: intro.dh_public,
            dial_round: intro.dialing_round,
        };

        let matched = {
            let mut state = self.lock_state();
            incoming.username = self.resolve_identity(&state, &intro.identity);
            match state.store.match_to_sent(&incoming) {
                Some(i) => {
                    let sent = state.store.sent.remove(i);
                    incoming.username = Some(sent.username.clone());
                    self.persist_state(&state);
                    Some(sent)
                },
                None => {
                    state.store.incoming.push(incoming.clone());
                    self.persist_state(&state);
                    None
                },
            }
        };

        match matched {
            Some(sent) => self.complete_match(incoming, sent),
            None => self.events.emit(Event::ReceivedFriendRequest(incoming)),
        }
    }

    /// Finish a matched (incoming, sent) pair: key check, then friendship.
    ///
    /// When the user pinned an expected key and the introduction carries a
    /// different one, no friend is created and the incoming request stays
    /// discarded so a spoofer cannot park requests in the queue.
    pub(crate) fn complete_match(
        &self,
        incoming: IncomingFriendRequest,
        sent: SentFriendRequest,
    ) {
        if let Some(expected) = sent.expected_key {
            if expected != incoming.long_term_key {
                let outgoing = OutgoingFriendRequest {
                    username: sent.username.clone(),
                    expected_key: sent.expected_key,
                    confirmation: sent.confirmation,
                    dial_round: Some(sent.dial_round),
                };
                self.events.emit(Event::UnexpectedSigningKey { incoming, outgoing });
                return;
            }
        }
        self.new_friend(&incoming, &sent);
    }
}

/// Attempt IBE decryption of every fixed-size span, in parallel.
async fn decrypt_spans(key: ibe::IdentityPrivateKey, data: Vec<u8>) -> Vec<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let spans: Vec<&[u8]> = data.chunks_exact(SIZE_ENCRYPTED_INTRO).collect();
        if spans.is_empty() {
            return Vec::new();
        }
        let workers = std::thread::available_parallelism().map_or(1, |n| n.get());
        let per_worker = spans.len().div_ceil(workers);

        std::thread::scope(|scope| {
            let handles: Vec<_> = spans
                .chunks(per_worker)
                .map(|part| {
                    scope.spawn(move || {
                        part.iter().filter_map(|span| ibe::decrypt(&key, span)).collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_default())
                .collect()
        })
    })
    .await
    .unwrap_or_default()
}
