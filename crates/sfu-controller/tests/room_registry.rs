//! Room registry lifecycle tests.
//!
//! Covers get-or-create races, explicit close, self-close on empty,
//! creation failures and drain on shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::collections::HashSet;
use std::time::Duration;

use sfu_controller::actors::SessionState;
use sfu_controller::engine::TransportDirection;
use sfu_controller::errors::SfuError;
use sfu_test_utils::fixtures;
use sfu_test_utils::{wait_until, MembershipOp, RoomHarness};

// ============================================================================
// Get or create
// ============================================================================

#[tokio::test]
async fn test_concurrent_get_or_create_yields_one_room() {
    let harness = RoomHarness::start(2).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let registry = harness.registry.clone();
        tasks.push(tokio::spawn(async move {
            registry.get_or_create("room-1").await
        }));
    }

    let mut incarnations = HashSet::new();
    for task in tasks {
        incarnations.insert(task.await.unwrap().unwrap().incarnation());
    }

    assert_eq!(incarnations.len(), 1);
    assert_eq!(harness.engine.routers().len(), 1);

    let status = harness.registry.get_status().await.unwrap();
    assert_eq!(status.room_count, 1);
    assert_eq!(status.creating_count, 0);
    assert!(!status.is_draining);

    harness.stop().await;
}

#[tokio::test]
async fn test_get_absent_room_is_not_found() {
    let harness = RoomHarness::start(1).await;

    let result = harness.registry.get("nowhere").await;
    assert!(matches!(result, Err(SfuError::RoomNotFound(ref id)) if id == "nowhere"));

    harness.stop().await;
}

#[tokio::test]
async fn test_distinct_rooms_get_distinct_routers() {
    let harness = RoomHarness::start(2).await;

    let a = harness.registry.get_or_create("room-a").await.unwrap();
    let b = harness.registry.get_or_create("room-b").await.unwrap();

    assert_ne!(a.incarnation(), b.incarnation());
    let state_a = a.get_state().await.unwrap();
    let state_b = b.get_state().await.unwrap();
    assert_ne!(state_a.router_id, state_b.router_id);
    assert_eq!(harness.registry.get_status().await.unwrap().room_count, 2);

    harness.stop().await;
}

#[tokio::test]
async fn test_room_gets_audio_observer() {
    let harness = RoomHarness::start(1).await;

    harness.registry.get_or_create("room-1").await.unwrap();
    assert!(harness.router().has_observer());

    harness.stop().await;
}

// ============================================================================
// Creation failures
// ============================================================================

#[tokio::test]
async fn test_router_failure_fails_every_waiter_and_allows_retry() {
    let harness = RoomHarness::start(1).await;
    harness.engine.worker(0).fail_router_creation(true);

    let (first, second) = tokio::join!(
        harness.registry.get_or_create("room-1"),
        harness.registry.get_or_create("room-1"),
    );
    assert!(matches!(first, Err(SfuError::Engine(_))));
    assert!(matches!(second, Err(SfuError::Engine(_))));

    let status = harness.registry.get_status().await.unwrap();
    assert_eq!(status.room_count, 0);
    assert_eq!(status.creating_count, 0);

    harness.engine.worker(0).fail_router_creation(false);
    let room = harness.registry.get_or_create("room-1").await.unwrap();
    assert!(!room.is_closed());

    harness.stop().await;
}

#[tokio::test]
async fn test_first_join_transport_failure_closes_room() {
    let harness = RoomHarness::start(1).await;
    let room = harness.registry.get_or_create("room-1").await.unwrap();
    let router = harness.router();
    router.fail_transport(Some(TransportDirection::Consumer));

    let result = harness
        .try_join("room-1", "alice", fixtures::speaker())
        .await;
    assert!(matches!(result, Err(SfuError::Engine(_))));

    // The half-built producer transport was released and the empty room closed
    assert_eq!(router.transport_count(), 0);
    assert!(wait_until(|| room.is_closed()).await);
    assert!(harness.wait_room_gone("room-1").await);

    let client = harness.join("room-1", "alice", fixtures::speaker()).await;
    assert_ne!(client.room.incarnation(), room.incarnation());

    harness.stop().await;
}

// ============================================================================
// Close and self-close
// ============================================================================

#[tokio::test]
async fn test_close_disconnects_everyone_and_closes_router() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    let bob = harness.join("room-1", "bob", fixtures::listener()).await;
    let router = harness.router();

    harness.registry.close("room-1").await.unwrap();

    assert!(matches!(
        harness.registry.get("room-1").await,
        Err(SfuError::RoomNotFound(_))
    ));
    assert!(wait_until(|| router.is_closed()).await);
    assert!(wait_until(|| alice.channel.is_disconnected() && bob.channel.is_disconnected()).await);
    assert!(wait_until(|| harness.metrics.participant_count() == 0).await);

    // Closing again is a no-op
    harness.registry.close("room-1").await.unwrap();

    harness.stop().await;
}

#[tokio::test]
async fn test_last_leave_removes_room_and_next_join_recreates() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    let first_incarnation = alice.room.incarnation();
    let router = harness.router();

    alice.leave().await;

    assert!(harness.wait_room_gone("room-1").await);
    assert!(wait_until(|| router.is_closed()).await);

    let again = harness.join("room-1", "alice", fixtures::speaker()).await;
    assert_ne!(again.room.incarnation(), first_incarnation);
    assert_eq!(harness.engine.open_routers().len(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_room_stays_while_participants_remain() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    let _bob = harness.join("room-1", "bob", fixtures::speaker()).await;

    alice.leave().await;

    let state = harness.state("room-1").await;
    assert_eq!(state.participants.len(), 1);
    assert_eq!(state.participants[0].participant_id, "bob");
    assert!(!harness.router().is_closed());

    harness.stop().await;
}

#[tokio::test]
async fn test_duplicate_join_is_reported_already_present() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;

    let duplicate = harness
        .try_join("room-1", "alice", fixtures::speaker())
        .await
        .unwrap();
    assert!(duplicate.is_none());

    let state = harness.state("room-1").await;
    assert_eq!(state.participants.len(), 1);
    assert_eq!(state.participants[0].session_id, alice.session_id);

    harness.stop().await;
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_membership_written_in_order() {
    let harness = RoomHarness::start(1).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    let bob = harness.join("room-1", "bob", fixtures::speaker()).await;
    alice.config().await.unwrap();
    bob.config().await.unwrap();

    assert!(wait_until(|| harness.membership.members("room-1").len() == 2).await);

    alice.leave().await;
    assert!(wait_until(|| !harness.membership.is_member("room-1", "alice")).await);

    let log = harness.membership.log();
    let alice_ops: Vec<_> = log
        .iter()
        .filter(|op| {
            matches!(op,
                MembershipOp::Add { participant_id, .. } | MembershipOp::Remove { participant_id, .. }
                    if participant_id == "alice")
        })
        .collect();
    assert_eq!(alice_ops.len(), 2);
    assert!(matches!(alice_ops[0], MembershipOp::Add { .. }));
    assert!(matches!(alice_ops[1], MembershipOp::Remove { .. }));

    harness.stop().await;
}

#[tokio::test]
async fn test_membership_failure_does_not_block_join() {
    let harness = RoomHarness::start(1).await;
    harness.membership.set_failing(true);

    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    alice.config_and_sync().await;

    let state = harness.state("room-1").await;
    assert_eq!(
        state.participant("alice").unwrap().state,
        SessionState::Joined
    );
    assert!(harness.membership.log().is_empty());

    harness.stop().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_drains_rooms_and_refuses_new_ones() {
    let harness = RoomHarness::start(2).await;
    let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
    let bob = harness.join("room-2", "bob", fixtures::speaker()).await;

    harness
        .registry
        .shutdown(Duration::from_secs(2))
        .await
        .unwrap();

    assert!(harness.engine.open_routers().is_empty());
    assert!(alice.channel.is_disconnected());
    assert!(bob.channel.is_disconnected());

    let status = harness.registry.get_status().await.unwrap();
    assert!(status.is_draining);
    assert_eq!(status.room_count, 0);

    assert!(matches!(
        harness.registry.get_or_create("room-3").await,
        Err(SfuError::Draining)
    ));

    harness.stop().await;
}
