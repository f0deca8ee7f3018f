//! Signaling: the bidirectional event channel between clients and rooms.
//!
//! # Modules
//!
//! - [`protocol`] - Wire frames and typed client/server events
//! - [`websocket`] - axum WebSocket server and the [`WsChannel`] implementation
//! - [`gateway`] - Connection admission (token, grants, room join)
//!
//! Rooms only see the [`SignalingChannel`] trait, so room logic runs the
//! same over a real socket and over the recording channel used in tests.

pub mod gateway;
pub mod protocol;
pub mod websocket;

pub use gateway::SignalingGateway;
pub use protocol::{ClientEvent, ServerEvent};
pub use websocket::{signaling_router, SignalingState, WsChannel};

use serde_json::Value;
use tokio::sync::oneshot;

/// One client connection as seen by a room.
pub trait SignalingChannel: Send + Sync {
    /// Connection id, unique per socket.
    fn id(&self) -> &str;

    /// Best-effort delivery. Dropped if the connection is gone or backed up.
    fn emit(&self, event: ServerEvent);

    /// Send an event expecting a client acknowledgement.
    ///
    /// The receiver errors if the connection closes before the ack arrives.
    fn request(&self, event: ServerEvent) -> oneshot::Receiver<Value>;

    /// Close the connection from the server side.
    fn disconnect(&self);
}

/// Reply slot for a client event that carried a request id.
///
/// Dropping it without replying sends nothing; failed events get no answer.
#[derive(Debug)]
pub struct Responder(oneshot::Sender<Value>);

impl Responder {
    #[must_use]
    pub fn new() -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn reply(self, value: Value) {
        let _ = self.0.send(value);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_responder_reply() {
        let (responder, rx) = Responder::new();
        responder.reply(Value::Bool(true));
        assert_eq!(rx.await.unwrap(), Value::Bool(true));
    }

    #[tokio::test]
    async fn test_dropped_responder_sends_nothing() {
        let (responder, rx) = Responder::new();
        drop(responder);
        assert!(rx.await.is_err());
    }
}
