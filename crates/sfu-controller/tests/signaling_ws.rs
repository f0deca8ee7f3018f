//! WebSocket signaling end-to-end tests.
//!
//! Serves the signaling router on an ephemeral port over the mock stack
//! and drives it with a tungstenite client.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sfu_controller::signaling::websocket::{signaling_router, SignalingState};
use sfu_test_utils::fixtures;
use sfu_test_utils::{eventually, wait_until, MockIdentityStore, RoomHarness, WAIT};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn identity() -> MockIdentityStore {
    MockIdentityStore::new()
        .with_session("tok-alice", "alice")
        .with_session("tok-bob", "bob")
        .with_grants("alice", "room-1", fixtures::speaker())
}

async fn serve(harness: &RoomHarness, max_connections: usize) -> (SocketAddr, CancellationToken) {
    let shutdown = CancellationToken::new();
    let state = SignalingState::new(
        Arc::clone(&harness.gateway),
        max_connections,
        64 * 1024,
        shutdown.clone(),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, signaling_router(state)).await.unwrap();
    });
    (addr, shutdown)
}

fn url(addr: SocketAddr, room_id: &str, token: &str) -> String {
    format!("ws://{addr}/ws?roomId={room_id}&token={token}")
}

async fn connect(addr: SocketAddr, token: &str) -> Client {
    let (ws, _) = connect_async(url(addr, "room-1", token)).await.unwrap();
    ws
}

async fn rejection_status(addr: SocketAddr, room_id: &str, token: &str) -> u16 {
    match connect_async(url(addr, room_id, token)).await {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("connection unexpectedly accepted"),
    }
}

async fn send(ws: &mut Client, frame: Value) {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
}

/// Next text frame, skipping pings. `None` once the server closes.
async fn next_frame(ws: &mut Client) -> Option<Value> {
    loop {
        let message = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("server sent nothing")?;
        match message {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Read frames until one matches `event`, returning it.
async fn expect_event(ws: &mut Client, event: &str) -> Value {
    loop {
        let frame = next_frame(ws)
            .await
            .unwrap_or_else(|| panic!("closed before '{event}'"));
        if frame["event"] == event {
            return frame;
        }
    }
}

/// Confirm the join and ack the roster. Returns the server config data.
async fn handshake(ws: &mut Client) -> Value {
    let config = expect_event(ws, "config").await;
    send(
        ws,
        json!({
            "event": "config",
            "id": 1,
            "data": { "device": {}, "receiveCapabilities": fixtures::full_capabilities() }
        }),
    )
    .await;

    let mut config_acked = false;
    let mut roster_acked = false;
    while !(config_acked && roster_acked) {
        let frame = next_frame(ws).await.expect("closed during handshake");
        match frame["event"].as_str() {
            Some("ack") if frame["id"] == 1 => {
                assert_eq!(frame["data"], json!(true));
                config_acked = true;
            }
            Some("joined") => {
                let id = frame["id"].as_u64().expect("joined is a request");
                send(ws, json!({ "event": "ack", "id": id, "data": true })).await;
                roster_acked = true;
            }
            _ => {}
        }
    }
    config["data"].clone()
}

async fn synced(harness: &RoomHarness, participant_id: &str) -> bool {
    eventually(|| async move {
        let Ok(room) = harness.registry.get("room-1").await else {
            return false;
        };
        room.get_state()
            .await
            .ok()
            .and_then(|s| s.participant(participant_id).map(|p| p.synced))
            .unwrap_or(false)
    })
    .await
}

// ============================================================================
// Session over a real socket
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_handshake_and_produce() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;
    let (addr, _shutdown) = serve(&harness, 16).await;

    let mut alice = connect(addr, "tok-alice").await;
    let config = handshake(&mut alice).await;
    assert_eq!(config["routerCapabilities"], fixtures::full_capabilities());
    let transport_id = config["producerTransport"]["id"].as_str().unwrap().to_string();
    assert!(config["consumerTransport"]["id"].is_string());
    assert!(synced(&harness, "alice").await);

    let mut bob = connect(addr, "tok-bob").await;
    let bob_config = handshake(&mut bob).await;
    // Bob holds no grants in this room
    assert!(bob_config.get("producerTransport").is_none());
    assert!(synced(&harness, "bob").await);

    send(
        &mut alice,
        json!({
            "event": "produce",
            "id": 2,
            "data": {
                "transportId": transport_id,
                "kind": "audio",
                "rtpParameters": fixtures::rtp_parameters(sfu_controller::engine::MediaKind::Audio),
                "appData": { "source": "mic" }
            }
        }),
    )
    .await;
    let ack = expect_event(&mut alice, "ack").await;
    assert_eq!(ack["id"], 2);
    let producer_id = ack["data"].as_str().unwrap().to_string();

    let request = expect_event(&mut bob, "make-consumer").await;
    assert_eq!(request["data"]["producerId"], producer_id.as_str());
    assert_eq!(request["data"]["peerId"], "alice");
    let consumer_id = request["data"]["consumerId"].as_str().unwrap().to_string();
    let id = request["id"].as_u64().unwrap();
    send(&mut bob, json!({ "event": "ack", "id": id, "data": true })).await;

    expect_event(&mut bob, "consumer-score").await;
    let router = harness.router();
    assert_eq!(router.consumer_paused(&consumer_id), Some(false));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_frame_is_ignored() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;
    let (addr, _shutdown) = serve(&harness, 16).await;

    let mut alice = connect(addr, "tok-alice").await;
    expect_event(&mut alice, "config").await;

    alice
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    send(&mut alice, json!({ "event": "no-such-event", "id": 7, "data": {} })).await;

    // Still connected and served
    send(
        &mut alice,
        json!({ "event": "config", "id": 9, "data": { "device": {} } }),
    )
    .await;
    loop {
        let frame = expect_event(&mut alice, "ack").await;
        assert_ne!(frame["id"], 7);
        if frame["id"] == 9 {
            assert_eq!(frame["data"], json!(true));
            break;
        }
    }

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_close_removes_participant() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;
    let (addr, _shutdown) = serve(&harness, 16).await;

    let mut bob = connect(addr, "tok-bob").await;
    handshake(&mut bob).await;
    let mut alice = connect(addr, "tok-alice").await;
    handshake(&mut alice).await;

    alice.close(None).await.unwrap();

    let left = expect_event(&mut bob, "participant-left").await;
    assert_eq!(left["data"]["participantId"], "alice");
    assert!(wait_until(|| harness.metrics.participant_count() == 1).await);

    bob.close(None).await.unwrap();
    assert!(harness.wait_room_gone("room-1").await);

    harness.stop().await;
}

// ============================================================================
// Rejections before upgrade
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bad_token_is_unauthorized() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;
    let (addr, _shutdown) = serve(&harness, 16).await;

    assert_eq!(rejection_status(addr, "room-1", "tok-mallory").await, 401);
    assert_eq!(harness.registry.get_status().await.unwrap().room_count, 0);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_store_outage_is_service_unavailable() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;
    let (addr, _shutdown) = serve(&harness, 16).await;
    harness.identity.set_unavailable(true);

    assert_eq!(rejection_status(addr, "room-1", "tok-alice").await, 503);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit_is_enforced() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;
    let (addr, _shutdown) = serve(&harness, 1).await;

    let mut alice = connect(addr, "tok-alice").await;
    expect_event(&mut alice, "config").await;

    assert_eq!(rejection_status(addr, "room-1", "tok-bob").await, 503);

    // The slot frees once the first connection ends
    alice.close(None).await.unwrap();
    assert!(harness.wait_room_gone("room-1").await);
    let mut bob = None;
    for _ in 0..100 {
        if let Ok((ws, _)) = connect_async(url(addr, "room-1", "tok-bob")).await {
            bob = Some(ws);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut bob = bob.expect("slot never freed");
    expect_event(&mut bob, "config").await;

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_sockets_and_refuses_new_ones() {
    let harness = RoomHarness::start_with(1, identity(), true, true).await;
    let (addr, shutdown) = serve(&harness, 16).await;

    let mut alice = connect(addr, "tok-alice").await;
    expect_event(&mut alice, "config").await;

    shutdown.cancel();

    // Existing socket is closed by the server
    loop {
        if next_frame(&mut alice).await.is_none() {
            break;
        }
    }
    assert!(harness.wait_room_gone("room-1").await);

    assert_eq!(rejection_status(addr, "room-1", "tok-bob").await, 503);

    harness.stop().await;
}
