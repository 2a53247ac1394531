//! The dialing round engine.
//!
//! Simpler than add-friend: no PKGs, three phases. `newround` installs
//! round state and advances the monotonic `last_dialing_round` counter
//! that new introductions reference, `mix` emits one onion carrying a
//! fixed number of dial-token slots (queued calls first, cover for the
//! rest), and `mailbox` downloads the round's bloom filter and probes it
//! with the tokens every confirmed friend would have used to reach us.

use std::sync::{Arc, atomic::Ordering};

use alpenhorn_crypto::{bloom::Filter, mailbox::mailbox, onion};
use alpenhorn_proto::{
    DialMessage, SignedConfig,
    coordinator::{MailboxUrl, MixRound, NewRound},
    mix::SIZE_DIAL_TOKEN,
};
use rand::{RngCore, rngs::OsRng};

use crate::{
    client::{ClientInner, INTENT_COUNT, MixInfo, NUM_DIAL_TOKENS, ROUND_RETENTION},
    error::Error,
    event::Event,
    store::OutgoingCall,
};

/// Per-round state for the dialing protocol.
pub(crate) struct DialingRound {
    pub(crate) round: u32,
    pub(crate) config: SignedConfig,
    /// Set once the round's onion has been sent; carries what the bloom
    /// filter probe needs.
    pub(crate) phase: tokio::sync::Mutex<Option<MixInfo>>,
}

impl DialingRound {
    pub(crate) fn new(round: u32, config: SignedConfig) -> Self {
        Self { round, config, phase: tokio::sync::Mutex::new(None) }
    }
}

impl ClientInner {
    /// `newround`: install round state and advance the dialing counter.
    pub(crate) async fn dialing_new_round(&self, v: NewRound) {
        let trusted = {
            let mut state = self.lock_state();
            if let Some(existing) = state.dialing.rounds.get(&v.round) {
                if existing.config.hash() != v.config_hash {
                    self.events.error(Error::Internal(format!(
                        "coordinator announced different configs for dialing round {}",
                        v.round
                    )));
                }
                return;
            }
            if v.config_hash == state.dialing.config_hash {
                let config = state.dialing.config.clone();
                state.dialing.rounds.insert(v.round, Arc::new(DialingRound::new(v.round, config)));
                state.dialing.collect_garbage(v.round);
                self.advance_dialing_round(&mut state, v.round);
                return;
            }
            state.dialing.config.clone()
        };

        let chain = match self.verifier.fetch_and_verify(&trusted, &v.config_hash).await {
            Ok(chain) => chain,
            Err(err) => {
                self.events.error(err);
                return;
            },
        };
        let Some(new_config) = chain.first().cloned() else {
            let mut state = self.lock_state();
            if v.config_hash == state.dialing.config_hash
                && !state.dialing.rounds.contains_key(&v.round)
            {
                let config = state.dialing.config.clone();
                state.dialing.rounds.insert(v.round, Arc::new(DialingRound::new(v.round, config)));
                state.dialing.collect_garbage(v.round);
                self.advance_dialing_round(&mut state, v.round);
            }
            return;
        };

        {
            let mut state = self.lock_state();
            if !state.dialing.rounds.contains_key(&v.round) {
                state
                    .dialing
                    .rounds
                    .insert(v.round, Arc::new(DialingRound::new(v.round, new_config.clone())));
                state.dialing.collect_garbage(v.round);
            }
            state.dialing.config = new_config.clone();
            state.dialing.config_hash = v.config_hash.clone();
            self.advance_dialing_round(&mut state, v.round);
            self.persist_state(&state);
        }

        self.events.emit(Event::NewConfig { service: "Dialing".to_string(), chain });
    }

    /// Monotonically advance `last_dialing_round` (release ordering; the
    /// add-friend introduction generator reads it with acquire) and expire
    /// sent requests whose dial round can no longer pair.
    fn advance_dialing_round(&self, state: &mut crate::client::EngineState, round: u32) {
        self.last_dialing_round.fetch_max(round, Ordering::Release);
        state.store.expire_sent(round, ROUND_RETENTION);
    }

    /// `mix`: emit one onion carrying the round's dial-token slots.
    pub(crate) async fn send_dialing_onion(&self, v: MixRound) {
        let round = v.mix_settings.round;
        if v.mix_settings.service != "Dialing" {
            self.events.error(Error::MalformedMessage(format!(
                "dialing channel got mix settings for {:?}",
                v.mix_settings.service
            )));
            return;
        }

        let round_state = self.lock_state().dialing.rounds.get(&round).cloned();
        let Some(round_state) = round_state else {
            self.events
                .error(Error::Internal(format!("send dial onion: round {round} not configured")));
            return;
        };
        debug_assert_eq!(round_state.round, round);

        if !self.verify_mix_signatures(&round_state.config, &v) {
            return;
        }

        let mut phase = round_state.phase.lock().await;
        if phase.is_some() {
            return;
        }

        // Pull queued calls up to the slot count; cover fills the rest.
        let calls: Vec<OutgoingCall> = {
            let mut state = self.lock_state();
            let take = state.store.outgoing_calls.len().min(NUM_DIAL_TOKENS);
            state.store.outgoing_calls.drain(..take).collect()
        };

        let mut payload = Vec::with_capacity(NUM_DIAL_TOKENS * (8 + SIZE_DIAL_TOKEN));
        let mut sent_calls = Vec::new();
        for slot in 0..NUM_DIAL_TOKENS {
            let message = match calls.get(slot) {
                Some(call) => {
                    let token = {
                        let mut wheel = self.lock_wheel();
                        wheel.dial_token(&call.username, round, call.intent)
                    };
                    match token {
                        Some(token) => {
                            sent_calls.push(call.clone());
                            DialMessage {
                                mailbox: mailbox(
                                    &call.username,
                                    &v.mix_settings.mailbox_key,
                                    v.mix_settings.num_mailboxes,
                                ),
                                token,
                            }
                        },
                        None => {
                            // The keywheel has turned past this round; the
                            // call is dropped, the slot becomes cover.
                            tracing::warn!(friend = %call.username, round, "cannot derive dial token");
                            cover_dial(v.mix_settings.num_mailboxes)
                        },
                    }
                },
                None => cover_dial(v.mix_settings.num_mailboxes),
            };
            payload.extend_from_slice(&message.encode());
        }

        {
            let wheel = self.lock_wheel();
            self.persist_keywheel(&wheel);
        }

        let (sealed, _reply_keys) = onion::seal(&payload, &v.mix_settings.onion_keys);
        if !self.send_onion(round, sealed, false) {
            return;
        }
        *phase = Some(MixInfo {
            mailbox_key: v.mix_settings.mailbox_key,
            num_mailboxes: v.mix_settings.num_mailboxes,
        });
        drop(phase);

        for call in sent_calls {
            self.events.emit(Event::SentCall(call));
        }
    }

    /// `mailbox`: download the bloom filter and probe for calls to us.
    pub(crate) async fn scan_dialing_mailbox(&self, v: MailboxUrl) {
        let round_state = self.lock_state().dialing.rounds.get(&v.round).cloned();
        let Some(round_state) = round_state else {
            return;
        };

        let mix_info = {
            let phase = round_state.phase.lock().await;
            let Some(mix_info) = *phase else {
                return;
            };
            mix_info
        };

        let mailbox_id = mailbox(&self.username, &mix_info.mailbox_key, v.num_mailboxes);
        let cdn = round_state.config.inner.cdn().clone();
        let data = match self.mailbox_fetcher.fetch(&cdn, &v.url, mailbox_id).await {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(err) => {
                self.events.error(Error::Transport(format!("fetching dialing mailbox: {err}")));
                return;
            },
        };

        // A garbled filter is untrusted input; drop it silently.
        let Ok(filter) = Filter::unmarshal(&data) else {
            tracing::warn!(round = v.round, "dropping malformed bloom filter");
            return;
        };

        let friends: Vec<String> = {
            let state = self.lock_state();
            state.store.friends.keys().cloned().collect()
        };

        let mut hits = Vec::new();
        {
            let mut wheel = self.lock_wheel();
            for username in &friends {
                for intent in 0..INTENT_COUNT {
                    let Some(token) = wheel.dial_token(username, v.round, intent) else {
                        continue;
                    };
                    if filter.test(&token) {
                        hits.push((username.clone(), intent));
                    }
                }
            }
            self.persist_keywheel(&wheel);
        }

        for (username, intent) in hits {
            self.events.emit(Event::ReceivedCall { username, round: v.round, intent });
        }
    }
}

/// A cover dial: random token, out-of-range mailbox.
fn cover_dial(num_mailboxes: u32) -> DialMessage {
    let mut token = [0u8; SIZE_DIAL_TOKEN];
    OsRng.fill_bytes(&mut token);
    DialMessage { mailbox: u64::from(num_mailboxes), token }
}
