//! Failure containment tests.
//!
//! A failing handler, a stale session or an engine notification about
//! something the room no longer tracks must never take the room down.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use serde_json::json;
use sfu_controller::engine::{ConsumerCloseCause, EngineEvent, MediaKind};
use sfu_test_utils::fixtures;
use sfu_test_utils::{wait_until, RoomHarness};

#[tokio::test]
async fn test_consume_failure_skips_pairs_and_room_keeps_serving() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    let bob = harness.join("room-1", "bob", fixtures::listener()).await;
    let carol = harness.join("room-1", "carol", fixtures::listener()).await;
    for client in [&alice, &bob, &carol] {
        client.config_and_sync().await;
    }
    let router = harness.router();

    router.fail_consume(true);
    let audio = alice.produce(MediaKind::Audio).await;
    // The producer survives failed fan-out
    assert!(audio.is_some());
    assert!(harness.metrics.handler_failure_count() >= 2);
    assert!(bob.channel.make_consumers().is_empty());
    assert!(carol.channel.make_consumers().is_empty());

    router.fail_consume(false);
    let video = alice.produce(MediaKind::Video).await.unwrap();
    assert!(wait_until(|| {
        bob.channel.make_consumer_for(&video).is_some()
            && carol.channel.make_consumer_for(&video).is_some()
    })
    .await);

    harness.stop().await;
}

#[tokio::test]
async fn test_produce_failure_sends_no_reply() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    alice.config_and_sync().await;
    let router = harness.router();

    router.fail_produce(true);
    assert_eq!(alice.produce(MediaKind::Audio).await, None);
    assert_eq!(harness.metrics.handler_failure_count(), 1);
    assert!(harness.state("room-1").await.participant("alice").unwrap().producers.is_empty());

    router.fail_produce(false);
    assert!(alice.produce(MediaKind::Audio).await.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn test_stale_session_is_rejected() {
    let harness = RoomHarness::start(1).await;
    let _bob = harness.join("room-1", "bob", fixtures::listener()).await;
    let old = harness.join("room-1", "alice", fixtures::speaker()).await;
    old.config_and_sync().await;
    old.leave().await;

    let current = harness.join("room-1", "alice", fixtures::speaker()).await;
    current.config_and_sync().await;
    assert_ne!(old.session_id, current.session_id);

    // Events from the old connection are refused
    assert_eq!(old.produce_on("whatever", MediaKind::Audio).await, None);
    assert_eq!(old.config().await, None);

    // A late disconnect of the old session leaves the new one alone
    old.leave().await;
    let state = harness.state("room-1").await;
    let alice = state.participant("alice").unwrap();
    assert_eq!(alice.session_id, current.session_id);
    assert!(!current.channel.is_disconnected());

    assert!(current.produce(MediaKind::Audio).await.is_some());

    harness.stop().await;
}

#[tokio::test]
async fn test_events_for_unknown_ids_are_ignored() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    alice.config_and_sync().await;
    let router = harness.router();
    alice.channel.clear();

    router.emit(EngineEvent::ConsumerScore {
        consumer_id: "ghost".to_string(),
        score: json!({"score": 3}),
    });
    router.emit(EngineEvent::ConsumerClosed {
        consumer_id: "ghost".to_string(),
        cause: ConsumerCloseCause::TransportClosed,
    });
    router.emit(EngineEvent::ConsumerProducerPaused {
        consumer_id: "ghost".to_string(),
    });
    router.emit(EngineEvent::ProducerClosed {
        producer_id: "ghost".to_string(),
    });
    router.emit_volumes(&[("ghost", -20)]);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The room is still answering and nothing reached the client
    let state = harness.state("room-1").await;
    assert!(state.active_speaker.is_none());
    assert!(alice.channel.events().is_empty());
    assert_eq!(harness.metrics.handler_failure_count(), 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_participant_event_is_contained() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    alice.config_and_sync().await;

    let (responder, reply) = sfu_controller::signaling::Responder::new();
    alice
        .room
        .client_event(
            "mallory".to_string(),
            alice.session_id,
            fixtures::connect_event("t-1"),
            Some(responder),
        )
        .await
        .unwrap();
    // Dropped responder, no reply
    assert!(reply.await.is_err());
    assert_eq!(harness.metrics.handler_failure_count(), 1);

    assert!(alice.produce(MediaKind::Audio).await.is_some());

    harness.stop().await;
}
