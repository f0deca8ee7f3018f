//! Authorization gate and admission tests.
//!
//! Grants decide which transports a participant gets and which media
//! kinds it may produce; the gateway resolves them from the session token.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use serde_json::{json, Value};
use sfu_controller::engine::MediaKind;
use sfu_controller::errors::SfuError;
use sfu_controller::permissions::{Grants, Permission};
use sfu_test_utils::fixtures;
use sfu_test_utils::{MockIdentityStore, RoomHarness};

// ============================================================================
// Produce policy
// ============================================================================

#[tokio::test]
async fn test_speak_grant_produces_audio_only() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::audio_only()).await;
    alice.config_and_sync().await;

    let audio = alice.produce(MediaKind::Audio).await;
    assert!(audio.is_some());

    // Policy rejection answers null rather than failing
    let transport_id = alice.producer_transport_id().unwrap();
    let reply = alice
        .send(fixtures::produce_event(&transport_id, MediaKind::Video))
        .await;
    assert_eq!(reply, Some(Value::Null));

    let state = harness.state("room-1").await;
    let producers = &state.participant("alice").unwrap().producers;
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0].kind, MediaKind::Audio);
    assert_eq!(harness.router().producer_ids().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_share_video_grant_produces_video_only() {
    let harness = RoomHarness::start(1).await;
    let grants = Grants::with_permissions([Permission::ShareVideo]);
    let alice = harness.join("room-1", "alice", grants).await;
    alice.config_and_sync().await;

    assert!(alice.produce(MediaKind::Video).await.is_some());
    let transport_id = alice.producer_transport_id().unwrap();
    assert_eq!(
        alice
            .send(fixtures::produce_event(&transport_id, MediaKind::Audio))
            .await,
        Some(Value::Null)
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_admin_produces_everything() {
    let harness = RoomHarness::start(1).await;
    let root = harness.join("room-1", "root", fixtures::admin()).await;
    root.config_and_sync().await;

    assert!(root.produce(MediaKind::Audio).await.is_some());
    assert!(root.produce(MediaKind::Video).await.is_some());

    let state = harness.state("room-1").await;
    assert!(state.participant("root").unwrap().is_admin);

    harness.stop().await;
}

#[tokio::test]
async fn test_listener_gets_no_producer_transport() {
    let harness = RoomHarness::start(1).await;
    let bob = harness.join("room-1", "bob", fixtures::listener()).await;
    bob.config_and_sync().await;

    let config = bob.channel.config();
    assert!(config.producer_transport.is_none());
    assert!(config.consumer_transport.is_some());
    assert_eq!(config.router_capabilities, fixtures::full_capabilities());

    // Any transport id the listener names gets a null producer id, not a failure
    let consumer_transport = bob.consumer_transport_id().unwrap();
    let reply = bob
        .send(fixtures::produce_event(&consumer_transport, MediaKind::Audio))
        .await;
    assert_eq!(reply, Some(Value::Null));
    let reply = bob
        .send(fixtures::produce_event("no-such-transport", MediaKind::Video))
        .await;
    assert_eq!(reply, Some(Value::Null));
    assert_eq!(harness.router().producer_ids().len(), 0);
    assert_eq!(harness.metrics.handler_failure_count(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_produce_before_config_is_rejected() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;

    assert_eq!(alice.produce(MediaKind::Audio).await, None);
    assert!(harness.router().producer_ids().is_empty());

    // The session still works once configured
    alice.config_and_sync().await;
    assert!(alice.produce(MediaKind::Audio).await.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn test_foreign_producer_cannot_be_closed() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    let bob = harness.join("room-1", "bob", fixtures::speaker()).await;
    alice.config_and_sync().await;
    bob.config_and_sync().await;
    let producer_id = alice.produce(MediaKind::Audio).await.unwrap();

    assert_eq!(bob.close_producer(&producer_id).await, None);
    assert_eq!(bob.pause_producer(&producer_id).await, None);

    assert_eq!(harness.router().producer_ids(), vec![producer_id.clone()]);
    assert_eq!(harness.router().producer_paused(&producer_id), Some(false));

    harness.stop().await;
}

#[tokio::test]
async fn test_foreign_consumer_ids_rejected_atomically() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    let bob = harness.join("room-1", "bob", fixtures::speaker()).await;
    let carol = harness.join("room-1", "carol", fixtures::listener()).await;
    for client in [&alice, &bob, &carol] {
        client.config_and_sync().await;
    }
    let alices = alice.produce(MediaKind::Audio).await.unwrap();
    let bobs = bob.produce(MediaKind::Audio).await.unwrap();
    assert!(sfu_test_utils::wait_until(|| {
        carol.channel.make_consumer_for(&alices).is_some()
            && bob.channel.make_consumer_for(&alices).is_some()
    })
    .await);

    let carols = carol.channel.make_consumer_for(&alices).unwrap().consumer_id;
    let bobs_consumer = bob.channel.make_consumer_for(&alices).unwrap().consumer_id;

    // One foreign id spoils the whole request
    assert_eq!(carol.pause_consumers(&[&carols, &bobs_consumer]).await, None);

    let state = harness.state("room-1").await;
    assert!(!state.participant("carol").unwrap().consumer_of(&alices).unwrap().client_paused);
    assert!(!state.participant("bob").unwrap().consumer_of(&alices).unwrap().client_paused);
    assert!(state.participant("alice").unwrap().consumer_of(&bobs).is_some());

    harness.stop().await;
}

// ============================================================================
// Gateway admission
// ============================================================================

fn identity() -> MockIdentityStore {
    MockIdentityStore::new()
        .with_session("tok-alice", "alice")
        .with_session("tok-bob", "bob")
        .with_admin_session("tok-root", "root")
        .with_grants("alice", "room-1", fixtures::audio_only())
}

#[tokio::test]
async fn test_admit_resolves_grants_from_store() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;

    let alice = harness.admit("room-1", "tok-alice").await.unwrap().unwrap();
    assert_eq!(alice.participant_id, "alice");
    alice.config_and_sync().await;
    assert!(alice.producer_transport_id().is_some());
    assert!(alice.produce(MediaKind::Audio).await.is_some());

    // No grants in this room: listener
    let bob = harness.admit("room-1", "tok-bob").await.unwrap().unwrap();
    assert!(bob.producer_transport_id().is_none());

    let root = harness.admit("room-1", "tok-root").await.unwrap().unwrap();
    root.config_and_sync().await;
    assert!(root.produce(MediaKind::Video).await.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn test_admit_rejects_unknown_token() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;

    let result = harness.admit("room-1", "tok-mallory").await;
    assert!(matches!(result, Err(SfuError::Unauthorized)));
    // No room is created for a rejected connection
    assert_eq!(harness.registry.get_status().await.unwrap().room_count, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_admit_rejects_empty_room_id() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;

    let result = harness.admit("  ", "tok-alice").await;
    assert!(matches!(result, Err(SfuError::PolicyRejected(_))));

    harness.stop().await;
}

#[tokio::test]
async fn test_admit_with_store_down_is_transient() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;
    harness.identity.set_unavailable(true);

    let err = harness.admit("room-1", "tok-alice").await.unwrap_err();
    assert!(matches!(err, SfuError::Redis(_)));
    assert_eq!(
        err.class(),
        sfu_controller::errors::ErrorClass::Transient
    );
    assert_eq!(err.client_message(), "An internal error occurred");

    harness.stop().await;
}

#[tokio::test]
async fn test_revoked_token_rejected_on_next_connect() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;
    let first = harness.admit("room-1", "tok-alice").await.unwrap().unwrap();
    first.leave().await;

    harness.identity.revoke_session("tok-alice");
    assert!(matches!(
        harness.admit("room-1", "tok-alice").await,
        Err(SfuError::Unauthorized)
    ));

    harness.stop().await;
}

// ============================================================================
// Deployment switches
// ============================================================================

#[tokio::test]
async fn test_allow_produce_off_overrides_admin() {
    let harness = RoomHarness::start_with(1, identity(), false, true).await;

    let root = harness.admit("room-1", "tok-root").await.unwrap().unwrap();
    assert!(root.producer_transport_id().is_none());
    assert!(root.consumer_transport_id().is_some());

    harness.stop().await;
}

#[tokio::test]
async fn test_allow_consume_off_skips_fanout() {
    let harness = RoomHarness::start_with(1, identity(), true, false).await;

    let alice = harness.admit("room-1", "tok-alice").await.unwrap().unwrap();
    let bob = harness.admit("room-1", "tok-bob").await.unwrap().unwrap();
    assert!(bob.consumer_transport_id().is_none());
    alice.config_and_sync().await;
    bob.config_and_sync().await;

    assert!(alice.produce(MediaKind::Audio).await.is_some());
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(bob.channel.make_consumers().is_empty());
    assert_eq!(harness.router().consume_calls(), 0);
    assert_eq!(
        bob.send(sfu_controller::signaling::ClientEvent::ConsumersPaused(vec![]))
            .await,
        Some(json!(true))
    );

    harness.stop().await;
}
