//! WebSocket signaling server.
//!
//! `GET /ws?roomId=..&token=..` authenticates before upgrading, so a bad
//! token gets `401` and a full server gets `503` without a socket. After
//! the upgrade each connection runs:
//!
//! - a send task draining a bounded outbound queue into the socket
//! - the read loop, which resolves acks and forwards events to the room
//!
//! The outbound queue is bounded; when a slow client lets it fill up,
//! further frames for that client are dropped and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::gateway::{AdmissionTicket, JoinedSession, SignalingGateway};
use super::protocol::{parse_inbound, Frame, Inbound};
use super::{Responder, ServerEvent, SignalingChannel};
use crate::actors::DisconnectReason;
use crate::errors::{ErrorClass, SfuError};
use crate::observability::metrics as prom;

/// Outbound frames buffered per connection.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Server side of one WebSocket connection.
pub struct WsChannel {
    id: String,
    outbound: mpsc::Sender<Message>,
    /// Requests awaiting a client ack, by frame id.
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl WsChannel {
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Message>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        }
    }

    /// Cancelled once either side closed the connection.
    #[must_use]
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    fn send_frame(&self, frame: &Frame) -> bool {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "sfu.signaling",
                    connection_id = %self.id,
                    event = %frame.event,
                    error = %e,
                    "Failed to encode frame"
                );
                return false;
            }
        };

        match self.outbound.try_send(Message::Text(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    target: "sfu.signaling",
                    connection_id = %self.id,
                    event = %frame.event,
                    "Outbound queue full, dropping frame"
                );
                prom::record_frame_dropped();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver a client ack to the waiting request. False for unknown ids.
    pub fn resolve_ack(&self, id: u64, data: Value) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(data);
                true
            }
            None => false,
        }
    }

    /// Answer a client request.
    pub fn send_ack(&self, id: u64, data: Value) {
        self.send_frame(&Frame::ack(id, data));
    }

    /// Drop all waiting requests; their receivers observe the close.
    fn fail_pending(&self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl SignalingChannel for WsChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, event: ServerEvent) {
        if self.closed.is_cancelled() {
            return;
        }
        match event.to_frame(None) {
            Ok(frame) => {
                self.send_frame(&frame);
            }
            Err(e) => warn!(
                target: "sfu.signaling",
                connection_id = %self.id,
                error = %e,
                "Failed to encode event"
            ),
        }
    }

    fn request(&self, event: ServerEvent) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        if self.closed.is_cancelled() {
            return rx;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = match event.to_frame(Some(id)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    target: "sfu.signaling",
                    connection_id = %self.id,
                    error = %e,
                    "Failed to encode request"
                );
                return rx;
            }
        };

        // Register before sending so a fast ack finds its waiter
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        if !self.send_frame(&frame) {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        }
        rx
    }

    fn disconnect(&self) {
        self.closed.cancel();
    }
}

/// Shared state of the signaling server.
#[derive(Clone)]
pub struct SignalingState {
    gateway: Arc<SignalingGateway>,
    connections: Arc<Semaphore>,
    max_message_bytes: usize,
    shutdown: CancellationToken,
}

impl SignalingState {
    #[must_use]
    pub fn new(
        gateway: Arc<SignalingGateway>,
        max_connections: usize,
        max_message_bytes: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            connections: Arc::new(Semaphore::new(max_connections)),
            max_message_bytes,
            shutdown,
        }
    }
}

/// Query parameters of the upgrade request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub room_id: String,
    pub token: String,
}

/// Build the signaling router.
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn rejection_status(err: &SfuError) -> StatusCode {
    match err {
        SfuError::Unauthorized => StatusCode::UNAUTHORIZED,
        SfuError::PolicyRejected(_) => StatusCode::BAD_REQUEST,
        e if e.class() == ErrorClass::Transient => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<SignalingState>,
) -> Response {
    if state.shutdown.is_cancelled() {
        prom::record_connection_rejected("draining");
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    }

    // Acquire connection permit (non-blocking)
    let Ok(permit) = Arc::clone(&state.connections).try_acquire_owned() else {
        warn!(target: "sfu.signaling", "Connection limit reached, rejecting WebSocket upgrade");
        prom::record_connection_rejected("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    let ticket = match state
        .gateway
        .authenticate(&params.room_id, &params.token)
        .await
    {
        Ok(ticket) => ticket,
        Err(e) => {
            debug!(
                target: "sfu.signaling",
                room_id = %params.room_id,
                error = %e,
                "Connection rejected"
            );
            prom::record_connection_rejected(e.class().as_str());
            return (rejection_status(&e), e.client_message()).into_response();
        }
    };

    ws.max_message_size(state.max_message_bytes)
        .on_failed_upgrade(|error| {
            warn!(target: "sfu.signaling", error = %error, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| handle_socket(socket, ticket, state, permit))
}

/// Write queued frames to the socket until the channel is closed, then
/// flush whatever is still queued and send `Close`.
async fn forward_outbound<S>(mut sink: S, mut rx: mpsc::Receiver<Message>, closed: CancellationToken)
where
    S: futures::Sink<Message> + Unpin,
{
    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
        }
    }
    while let Ok(message) = rx.try_recv() {
        if sink.send(message).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

async fn handle_socket(
    socket: WebSocket,
    ticket: AdmissionTicket,
    state: SignalingState,
    _permit: OwnedSemaphorePermit,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    let channel = Arc::new(WsChannel::new(tx));

    let send_task = tokio::spawn(forward_outbound(ws_sender, rx, channel.closed().clone()));

    let joined = match state
        .gateway
        .join(&ticket, Arc::clone(&channel) as Arc<dyn SignalingChannel>)
        .await
    {
        Ok(Some(joined)) => joined,
        Ok(None) => {
            info!(
                target: "sfu.signaling",
                room_id = %ticket.room_id,
                participant_id = %ticket.participant_id,
                "Participant already connected, closing duplicate connection"
            );
            channel.disconnect();
            let _ = send_task.await;
            return;
        }
        Err(e) => {
            warn!(
                target: "sfu.signaling",
                room_id = %ticket.room_id,
                participant_id = %ticket.participant_id,
                error = %e,
                "Failed to join room"
            );
            channel.disconnect();
            let _ = send_task.await;
            return;
        }
    };

    let reason = loop {
        tokio::select! {
            () = state.shutdown.cancelled() => break DisconnectReason::ServerShutdown,
            () = channel.closed().cancelled() => break DisconnectReason::ServerShutdown,
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&joined, &channel, &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break DisconnectReason::ClientClosed,
                Some(Ok(Message::Binary(_))) => {
                    debug!(
                        target: "sfu.signaling",
                        connection_id = %channel.id(),
                        "Ignoring binary frame"
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(
                        target: "sfu.signaling",
                        connection_id = %channel.id(),
                        error = %e,
                        "WebSocket receive error"
                    );
                    break DisconnectReason::TransportError;
                }
            },
        }
    };

    channel.disconnect();
    channel.fail_pending();

    if let Err(e) = joined
        .room
        .disconnect(joined.participant_id.clone(), joined.session_id, reason)
        .await
    {
        debug!(
            target: "sfu.signaling",
            participant_id = %joined.participant_id,
            error = %e,
            "Room already closed at disconnect"
        );
    }

    let _ = send_task.await;
    // _permit dropped here, releasing the connection slot
}

async fn handle_text(joined: &JoinedSession, channel: &Arc<WsChannel>, text: &str) {
    match parse_inbound(text) {
        Ok(Inbound::Ack { id, data }) => {
            if !channel.resolve_ack(id, data) {
                debug!(
                    target: "sfu.signaling",
                    connection_id = %channel.id(),
                    ack_id = id,
                    "Ack for unknown request"
                );
            }
        }
        Ok(Inbound::Event { event, id }) => {
            let name = event.name();
            let responder = id.map(|id| {
                let (responder, reply) = Responder::new();
                let channel = Arc::clone(channel);
                tokio::spawn(async move {
                    if let Ok(value) = reply.await {
                        channel.send_ack(id, value);
                    }
                });
                responder
            });

            if let Err(e) = joined
                .room
                .client_event(
                    joined.participant_id.clone(),
                    joined.session_id,
                    event,
                    responder,
                )
                .await
            {
                debug!(
                    target: "sfu.signaling",
                    event = name,
                    error = %e,
                    "Room closed, event dropped"
                );
            }
        }
        Err(e) => {
            debug!(
                target: "sfu.signaling",
                connection_id = %channel.id(),
                participant_id = %joined.participant_id,
                error = %e,
                "Malformed frame ignored"
            );
            prom::record_handler_failure("malformed", e.class().as_str());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::protocol::ParticipantRef;

    fn text_of(message: Message) -> Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => Value::String(format!("{other:?}")),
        }
    }

    #[tokio::test]
    async fn test_emit_writes_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let channel = WsChannel::new(tx);
        channel.emit(ServerEvent::ParticipantLeft(ParticipantRef {
            participant_id: "bob".to_string(),
        }));

        let frame = text_of(rx.recv().await.unwrap());
        assert_eq!(frame["event"], "participant-left");
        assert_eq!(frame["data"]["participantId"], "bob");
        assert!(frame.get("id").is_none());
    }

    #[tokio::test]
    async fn test_request_resolved_by_ack() {
        let (tx, mut rx) = mpsc::channel(4);
        let channel = WsChannel::new(tx);
        let reply = channel.request(ServerEvent::Joined(vec!["alice".to_string()]));

        let frame = text_of(rx.recv().await.unwrap());
        let id = frame["id"].as_u64().unwrap();
        assert!(channel.resolve_ack(id, Value::Bool(true)));
        assert_eq!(reply.await.unwrap(), Value::Bool(true));

        // Second ack for the same id is unknown
        assert!(!channel.resolve_ack(id, Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_frames() {
        let (tx, mut rx) = mpsc::channel(1);
        let channel = WsChannel::new(tx);
        channel.emit(ServerEvent::Joined(vec![]));
        let reply = channel.request(ServerEvent::Joined(vec![]));

        // Dropped request never resolves
        assert!(reply.await.is_err());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_stops_output() {
        let (tx, mut rx) = mpsc::channel(4);
        let channel = WsChannel::new(tx);
        let reply = channel.request(ServerEvent::Joined(vec![]));
        channel.disconnect();
        channel.fail_pending();

        assert!(reply.await.is_err());
        let _ = rx.recv().await;
        channel.emit(ServerEvent::Joined(vec![]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rejection_status() {
        assert_eq!(
            rejection_status(&SfuError::Unauthorized),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            rejection_status(&SfuError::PolicyRejected("x".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            rejection_status(&SfuError::Redis("down".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            rejection_status(&SfuError::NoWorkers),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_queued_frames_flushed_before_close() {
        let (tx, rx) = mpsc::channel(8);
        let channel = WsChannel::new(tx);
        for participant_id in ["bob", "carol"] {
            channel.emit(ServerEvent::ParticipantLeft(ParticipantRef {
                participant_id: participant_id.to_string(),
            }));
        }
        channel.disconnect();

        let (sink, written) = futures::channel::mpsc::unbounded::<Message>();
        forward_outbound(sink, rx, channel.closed().clone()).await;
        let written: Vec<Message> = written.collect().await;

        assert_eq!(written.len(), 3);
        let mut written = written.into_iter();
        for expected in ["bob", "carol"] {
            let frame = text_of(written.next().unwrap());
            assert_eq!(frame["event"], "participant-left");
            assert_eq!(frame["data"]["participantId"], expected);
        }
        assert!(matches!(written.next(), Some(Message::Close(None))));
    }
}
