//! Recording signaling channel.
//!
//! Stands in for a client socket. Every emitted or requested event is
//! recorded in order. Requests are answered according to an [`AckPolicy`],
//! chosen separately for the `joined` roster and for `make-consumer`.
//!
//! # Example
//!
//! ```rust,ignore
//! let channel = MockChannel::new("conn-1");
//! channel.set_consumer_policy(AckPolicy::Hold);
//! // ... drive the room ...
//! assert_eq!(channel.make_consumers().len(), 1);
//! channel.release_held(true);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use sfu_controller::signaling::protocol::{MakeConsumer, ServerConfig};
use sfu_controller::signaling::{ServerEvent, SignalingChannel};
use tokio::sync::oneshot;

/// How the simulated client answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Reply `true` immediately.
    Accept,
    /// Reply `false` immediately.
    Decline,
    /// Keep the request open until [`MockChannel::release_held`].
    Hold,
}

struct Policies {
    join: AckPolicy,
    consumer: AckPolicy,
}

/// In-memory [`SignalingChannel`].
pub struct MockChannel {
    id: String,
    events: Mutex<Vec<ServerEvent>>,
    held: Mutex<Vec<(ServerEvent, oneshot::Sender<Value>)>>,
    policies: Mutex<Policies>,
    disconnected: AtomicBool,
}

impl MockChannel {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            events: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            policies: Mutex::new(Policies {
                join: AckPolicy::Accept,
                consumer: AckPolicy::Accept,
            }),
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn set_join_policy(&self, policy: AckPolicy) {
        self.policies.lock().unwrap().join = policy;
    }

    pub fn set_consumer_policy(&self, policy: AckPolicy) {
        self.policies.lock().unwrap().consumer = policy;
    }

    /// Answer every held request with `accept`.
    pub fn release_held(&self, accept: bool) -> usize {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        let count = held.len();
        for (_, reply) in held {
            let _ = reply.send(Value::Bool(accept));
        }
        count
    }

    /// Drop held requests without answering, as a vanished client would.
    pub fn drop_held(&self) {
        self.held.lock().unwrap().clear();
    }

    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    // ---- inspection ----

    #[must_use]
    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().unwrap().clone()
    }

    #[must_use]
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(ServerEvent::name).collect()
    }

    /// Number of recorded events with wire name `name`.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// The initial `config` event. Panics if none was sent.
    #[must_use]
    pub fn config(&self) -> ServerConfig {
        self.events()
            .into_iter()
            .find_map(|e| match e {
                ServerEvent::Config(config) => Some(config),
                _ => None,
            })
            .expect("no config event recorded")
    }

    /// Roster from the `joined` event, if one was sent.
    #[must_use]
    pub fn joined_roster(&self) -> Option<Vec<String>> {
        self.events().into_iter().find_map(|e| match e {
            ServerEvent::Joined(roster) => Some(roster),
            _ => None,
        })
    }

    #[must_use]
    pub fn make_consumers(&self) -> Vec<MakeConsumer> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::MakeConsumer(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    /// `make-consumer` for `producer_id`, if any.
    #[must_use]
    pub fn make_consumer_for(&self, producer_id: &str) -> Option<MakeConsumer> {
        self.make_consumers()
            .into_iter()
            .find(|m| m.producer_id == producer_id)
    }

    #[must_use]
    pub fn consumer_closed_ids(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::ConsumerClosed(c) => Some(c.consumer_id),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn participants_joined(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::ParticipantJoined(p) => Some(p.participant_id),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn participants_left(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::ParticipantLeft(p) => Some(p.participant_id),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn policy_for(&self, event: &ServerEvent) -> AckPolicy {
        let policies = self.policies.lock().unwrap();
        match event {
            ServerEvent::Joined(_) => policies.join,
            _ => policies.consumer,
        }
    }
}

impl SignalingChannel for MockChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, event: ServerEvent) {
        if self.is_disconnected() {
            return;
        }
        self.events.lock().unwrap().push(event);
    }

    fn request(&self, event: ServerEvent) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        if self.is_disconnected() {
            // Sender dropped: the room sees a closed connection
            return rx;
        }
        self.events.lock().unwrap().push(event.clone());
        match self.policy_for(&event) {
            AckPolicy::Accept => {
                let _ = tx.send(Value::Bool(true));
            }
            AckPolicy::Decline => {
                let _ = tx.send(Value::Bool(false));
            }
            AckPolicy::Hold => self.held.lock().unwrap().push((event, tx)),
        }
        rx
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
        self.held.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfu_controller::signaling::protocol::ParticipantRef;

    fn left(id: &str) -> ServerEvent {
        ServerEvent::ParticipantLeft(ParticipantRef {
            participant_id: id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_accept_and_hold() {
        let channel = MockChannel::new("c");
        let accepted = channel.request(ServerEvent::Joined(vec![]));
        assert_eq!(accepted.await.unwrap(), Value::Bool(true));

        channel.set_join_policy(AckPolicy::Hold);
        let held = channel.request(ServerEvent::Joined(vec![]));
        assert_eq!(channel.held_count(), 1);
        assert_eq!(channel.release_held(false), 1);
        assert_eq!(held.await.unwrap(), Value::Bool(false));
    }

    #[tokio::test]
    async fn test_disconnect_drops_output_and_pending() {
        let channel = MockChannel::new("c");
        channel.set_join_policy(AckPolicy::Hold);
        let pending = channel.request(ServerEvent::Joined(vec![]));

        channel.disconnect();
        channel.emit(left("bob"));

        assert!(pending.await.is_err());
        assert!(channel.is_disconnected());
        assert_eq!(channel.event_names(), vec!["joined"]);
    }

    #[test]
    fn test_filters() {
        let channel = MockChannel::new("c");
        channel.emit(left("bob"));
        channel.emit(left("carol"));
        assert_eq!(channel.count("participant-left"), 2);
        assert_eq!(channel.participants_left(), vec!["bob", "carol"]);
        assert!(channel.joined_roster().is_none());
    }
}
