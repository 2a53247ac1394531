//! End-to-end add-friend scenarios over the in-memory world.

mod harness;

use alpenhorn_client::Event;
use alpenhorn_proto::coordinator::{MSG_MIX, MSG_NEW_ROUND, NewRound};
use harness::{World, envelope, run_addfriend_round};

fn is_confirmed(event: &Event, username: &str) -> bool {
    matches!(event, Event::ConfirmedFriend(f) if f.username == username)
}

#[tokio::test(flavor = "multi_thread")]
async fn mutual_requests_become_friends() {
    let world = World::new(2, 2);
    let alice = world.client("alice").await;
    let bob = world.client("bob").await;

    alice.client.add_friend("bob").unwrap();
    bob.client.add_friend("alice").unwrap();

    run_addfriend_round(&world, 1, &[&alice, &bob]).await;

    alice.handler.wait_for(|e| is_confirmed(e, "bob")).await;
    bob.handler.wait_for(|e| is_confirmed(e, "alice")).await;

    assert!(alice.client.friends().iter().any(|f| f.username == "bob"));
    assert!(bob.client.friends().iter().any(|f| f.username == "alice"));

    // Both sides also saw their own request go out.
    alice
        .handler
        .wait_for(|e| matches!(e, Event::SentFriendRequest(r) if r.username == "bob"))
        .await;
    bob.handler
        .wait_for(|e| matches!(e, Event::SentFriendRequest(r) if r.username == "alice"))
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cover_rounds_are_byte_indistinguishable() {
    let world = World::new(2, 2);
    let alice = world.client("alice").await;
    let bob = world.client("bob").await;

    // Round 1: real traffic.
    alice.client.add_friend("bob").unwrap();
    bob.client.add_friend("alice").unwrap();
    let real_onions = run_addfriend_round(&world, 1, &[&alice, &bob]).await;

    // Round 2: both queues empty; the engines emit cover.
    let cover_onions = run_addfriend_round(&world, 2, &[&alice, &bob]).await;

    assert_eq!(real_onions.len(), cover_onions.len());
    for (real, cover) in real_onions.iter().zip(&cover_onions) {
        assert_eq!(real.onion.len(), cover.onion.len());
    }

    // No request events fired for the cover round.
    let sent_events = |events: &[Event]| {
        events
            .iter()
            .filter(|e| matches!(e, Event::SentFriendRequest(_)))
            .count()
    };
    assert_eq!(sent_events(&alice.handler.snapshot()), 1);
    assert_eq!(sent_events(&bob.handler.snapshot()), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reannouncing_a_round_with_a_different_config_errors() {
    let world = World::new(1, 1);
    let alice = world.client("alice").await;

    let hash = world.addfriend_config.hash();
    alice
        .client
        .dispatch_addfriend(envelope(
            MSG_NEW_ROUND,
            &NewRound { round: 3, config_hash: hash.clone() },
        ))
        .await;

    // Same round, different hash: the round keeps its config and the
    // application hears about the inconsistency.
    alice
        .client
        .dispatch_addfriend(envelope(
            MSG_NEW_ROUND,
            &NewRound { round: 3, config_hash: "ab".repeat(32) },
        ))
        .await;

    alice.handler.wait_for(|e| matches!(e, Event::Error(_))).await;
    alice.handler.assert_never(|e| matches!(e, Event::NewConfig { .. })).await;

    // Re-announcing with the original hash stays idempotent: no second error.
    let errors_before = alice
        .handler
        .snapshot()
        .iter()
        .filter(|e| matches!(e, Event::Error(_)))
        .count();
    alice
        .client
        .dispatch_addfriend(envelope(MSG_NEW_ROUND, &NewRound { round: 3, config_hash: hash }))
        .await;
    let errors_after = alice
        .handler
        .snapshot()
        .iter()
        .filter(|e| matches!(e, Event::Error(_)))
        .count();
    assert_eq!(errors_before, errors_after);
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_signing_key_blocks_friendship() {
    let world = World::new(2, 2);
    let alice = world.client("alice").await;
    let bob = world.client("bob").await;

    // Alice pins a key that is not Bob's.
    alice.client.add_friend_with_expected_key("bob", [0xEE; 32]).unwrap();
    bob.client.add_friend("alice").unwrap();

    run_addfriend_round(&world, 1, &[&alice, &bob]).await;

    let event = alice
        .handler
        .wait_for(|e| matches!(e, Event::UnexpectedSigningKey { .. }))
        .await;
    match event {
        Event::UnexpectedSigningKey { incoming, outgoing } => {
            assert_eq!(outgoing.username, "bob");
            assert_eq!(incoming.username.as_deref(), Some("bob"));
            assert_ne!(incoming.long_term_key, [0xEE; 32]);
        },
        other => panic!("wrong event: {other:?}"),
    }

    alice.handler.assert_never(|e| is_confirmed(e, "bob")).await;
    assert!(alice.client.friends().is_empty());
    // The spoofable request was discarded, not parked for later approval.
    assert!(alice.client.incoming_friend_requests().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unsolicited_request_queues_for_approval() {
    let world = World::new(2, 2);
    let alice = world.client("alice").await;
    let bob = world.client("bob").await;

    // Only Bob asks; Alice has nothing queued.
    bob.client.add_friend("alice").unwrap();
    run_addfriend_round(&world, 1, &[&alice, &bob]).await;

    alice.handler.wait_for(|e| matches!(e, Event::ReceivedFriendRequest(_))).await;
    assert_eq!(alice.client.incoming_friend_requests().len(), 1);
    assert!(alice.client.friends().is_empty());

    // Alice knows who bob is out of band and approves; the confirmation
    // goes out in the next round and completes on Bob's side.
    alice.client.approve_friend_request("bob").unwrap();
    run_addfriend_round(&world, 2, &[&alice, &bob]).await;

    alice.handler.wait_for(|e| is_confirmed(e, "bob")).await;
    bob.handler.wait_for(|e| is_confirmed(e, "alice")).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn config_rotation_is_verified_and_adopted() {
    let world = World::new(1, 1);
    let alice = world.client("alice").await;

    // Guardians publish a successor config; the coordinator announces a
    // round under its hash.
    let mut next = world.addfriend_config.clone();
    next.created += 10;
    next.prev_config_hash = world.addfriend_config.hash();
    next.signatures = Default::default();
    next.sign(&world.guardian);
    world.config_source.publish(&next);

    alice
        .client
        .dispatch_addfriend(envelope(
            MSG_NEW_ROUND,
            &NewRound { round: 1, config_hash: next.hash() },
        ))
        .await;

    let event = alice
        .handler
        .wait_for(|e| matches!(e, Event::NewConfig { service, .. } if service == "AddFriend"))
        .await;
    match event {
        Event::NewConfig { chain, .. } => {
            assert_eq!(chain.len(), 1);
            assert_eq!(chain[0].hash(), next.hash());
        },
        other => panic!("wrong event: {other:?}"),
    }

    // Rounds proceed normally under the rotated config.
    alice
        .client
        .dispatch_addfriend(envelope(
            alpenhorn_proto::coordinator::MSG_PKG,
            &alpenhorn_proto::coordinator::PkgRound { round: 1, pkg_settings: world.pkg_settings(1) },
        ))
        .await;
    let mix = world.mix_round("AddFriend", 1);
    alice.client.dispatch_addfriend(envelope(MSG_MIX, &mix)).await;
    assert_eq!(alice.addfriend_sink.drain_onions().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsigned_config_rotation_is_refused() {
    let world = World::new(1, 1);
    let alice = world.client("alice").await;

    let mut next = world.addfriend_config.clone();
    next.created += 10;
    next.prev_config_hash = world.addfriend_config.hash();
    next.signatures = Default::default();
    // No guardian signature.
    world.config_source.publish(&next);

    alice
        .client
        .dispatch_addfriend(envelope(
            MSG_NEW_ROUND,
            &NewRound { round: 1, config_hash: next.hash() },
        ))
        .await;

    alice.handler.wait_for(|e| matches!(e, Event::Error(_))).await;
    alice.handler.assert_never(|e| matches!(e, Event::NewConfig { .. })).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_mix_announcement_still_emits_one_onion() {
    let world = World::new(1, 1);
    let alice = world.client("alice").await;

    let hash = world.addfriend_config.hash();
    alice
        .client
        .dispatch_addfriend(envelope(MSG_NEW_ROUND, &NewRound { round: 1, config_hash: hash }))
        .await;
    alice
        .client
        .dispatch_addfriend(envelope(
            alpenhorn_proto::coordinator::MSG_PKG,
            &alpenhorn_proto::coordinator::PkgRound { round: 1, pkg_settings: world.pkg_settings(1) },
        ))
        .await;

    let mix = world.mix_round("AddFriend", 1);
    alice.client.dispatch_addfriend(envelope(MSG_MIX, &mix)).await;
    alice.client.dispatch_addfriend(envelope(MSG_MIX, &mix)).await;

    assert_eq!(alice.addfriend_sink.drain_onions().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn round_state_is_garbage_collected() {
    let world = World::new(1, 1);
    let alice = world.client("alice").await;

    let hash = world.addfriend_config.hash();
    for round in 1..=40 {
        alice
            .client
            .dispatch_addfriend(envelope(
                MSG_NEW_ROUND,
                &NewRound { round, config_hash: hash.clone() },
            ))
            .await;
    }

    // Retention keeps a bounded window of rounds, not all forty.
    assert!(alice.client.addfriend_round_count() <= 11);
}

#[tokio::test(flavor = "multi_thread")]
async fn mix_settings_from_wrong_mixers_are_rejected() {
    let world = World::new(1, 2);
    let rogue = World::new(1, 2);
    let alice = world.client("alice").await;

    let hash = world.addfriend_config.hash();
    alice
        .client
        .dispatch_addfriend(envelope(MSG_NEW_ROUND, &NewRound { round: 1, config_hash: hash }))
        .await;

    // Settings signed by a different mix chain must not produce an onion.
    let forged = rogue.mix_round("AddFriend", 1);
    alice.client.dispatch_addfriend(envelope(MSG_MIX, &forged)).await;

    alice.handler.wait_for(|e| matches!(e, Event::Error(_))).await;
    assert!(alice.addfriend_sink.drain_onions().is_empty());
}
