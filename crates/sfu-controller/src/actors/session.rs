//! Per-participant session state owned by a room.
//!
//! A session never touches the engine itself; the room performs engine
//! calls and records the results here. Every lookup that a client can
//! influence returns an error instead of assuming the id exists.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::messages::{
    ConsumerSnapshot, ParticipantSnapshot, ProducerSnapshot, SessionState, TransportSnapshot,
};
use crate::engine::{AppData, MediaKind, RtpCapabilities, TransportDirection};
use crate::errors::SfuError;
use crate::permissions::Grants;
use crate::signaling::protocol::ClientConfig;
use crate::signaling::{ServerEvent, SignalingChannel};

/// A producer owned by this session.
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub kind: MediaKind,
    pub transport_id: String,
    pub app_data: AppData,
    pub paused: bool,
}

/// A consumer owned by this session.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub producer_id: String,
    pub producer_participant_id: String,
    pub kind: MediaKind,
    /// Paused by the client. Survives the acknowledgement.
    pub client_paused: bool,
    pub producer_paused: bool,
    /// The client acknowledged `make-consumer`; engine pause state follows `client_paused` from then on.
    pub acknowledged: bool,
}

/// One participant's connection-scoped state.
pub struct ParticipantSession {
    participant_id: String,
    session_id: Uuid,
    state: SessionState,
    channel: Arc<dyn SignalingChannel>,
    grants: Grants,
    device: Value,
    receive_capabilities: Option<RtpCapabilities>,
    data_capabilities: Option<Value>,
    synced: bool,
    transports: HashMap<String, TransportDirection>,
    producers: HashMap<String, ProducerRecord>,
    consumers: HashMap<String, ConsumerRecord>,
    /// producer id -> consumer id, at most one consumer per producer.
    consumer_by_producer: HashMap<String, String>,
    added_at: Instant,
    joined_at: DateTime<Utc>,
}

impl ParticipantSession {
    #[must_use]
    pub fn new(
        participant_id: String,
        channel: Arc<dyn SignalingChannel>,
        grants: Grants,
        transports: impl IntoIterator<Item = (String, TransportDirection)>,
    ) -> Self {
        Self {
            participant_id,
            session_id: Uuid::new_v4(),
            state: SessionState::Pending,
            channel,
            grants,
            device: Value::Null,
            receive_capabilities: None,
            data_capabilities: None,
            synced: false,
            transports: transports.into_iter().collect(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            consumer_by_producer: HashMap::new(),
            added_at: Instant::now(),
            joined_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.state == SessionState::Joined
    }

    /// Joined and past the roster acknowledgement.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.is_joined() && self.synced
    }

    #[must_use]
    pub fn grants(&self) -> &Grants {
        &self.grants
    }

    #[must_use]
    pub fn receive_capabilities(&self) -> Option<&RtpCapabilities> {
        self.receive_capabilities.as_ref()
    }

    #[must_use]
    pub fn device(&self) -> &Value {
        &self.device
    }

    #[must_use]
    pub fn data_capabilities(&self) -> Option<&Value> {
        self.data_capabilities.as_ref()
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<dyn SignalingChannel> {
        &self.channel
    }

    pub fn emit(&self, event: ServerEvent) {
        self.channel.emit(event);
    }

    /// Reject events from an older socket of the same participant.
    pub fn check_session(&self, session_id: Uuid) -> Result<(), SfuError> {
        if self.session_id == session_id {
            Ok(())
        } else {
            Err(SfuError::InvalidState(format!(
                "stale session for participant {}",
                self.participant_id
            )))
        }
    }

    /// `Pending -> Joined` on the client `config`.
    pub fn confirm_join(&mut self, config: ClientConfig) -> Result<(), SfuError> {
        if self.state != SessionState::Pending {
            return Err(SfuError::InvalidState(format!(
                "config received in state {:?}",
                self.state
            )));
        }
        self.device = config.device;
        self.receive_capabilities = config.receive_capabilities;
        self.data_capabilities = config.data_capabilities;
        self.state = SessionState::Joined;
        Ok(())
    }

    /// Mark the roster acknowledged. Returns false if it already was.
    pub fn mark_synced(&mut self) -> Result<bool, SfuError> {
        if !self.is_joined() {
            return Err(SfuError::InvalidState(format!(
                "roster acknowledged in state {:?}",
                self.state
            )));
        }
        Ok(!std::mem::replace(&mut self.synced, true))
    }

    /// Require `Joined`, for media operations.
    pub fn require_joined(&self) -> Result<(), SfuError> {
        if self.is_joined() {
            Ok(())
        } else {
            Err(SfuError::InvalidState(format!(
                "media operation in state {:?}",
                self.state
            )))
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.state = SessionState::Disconnected;
    }

    // ------------------------------------------------------------------
    // Transports
    // ------------------------------------------------------------------

    #[must_use]
    pub fn transport_for(&self, direction: TransportDirection) -> Option<&str> {
        self.transports
            .iter()
            .find(|(_, d)| **d == direction)
            .map(|(id, _)| id.as_str())
    }

    /// The transport must belong to this session.
    pub fn require_transport(&self, transport_id: &str) -> Result<TransportDirection, SfuError> {
        self.transports
            .get(transport_id)
            .copied()
            .ok_or_else(|| SfuError::UnknownTransport(transport_id.to_string()))
    }

    pub fn transport_ids(&self) -> impl Iterator<Item = &str> {
        self.transports.keys().map(String::as_str)
    }

    // ------------------------------------------------------------------
    // Producers
    // ------------------------------------------------------------------

    pub fn add_producer(&mut self, producer_id: String, record: ProducerRecord) {
        self.producers.insert(producer_id, record);
    }

    pub fn require_producer_mut(
        &mut self,
        producer_id: &str,
    ) -> Result<&mut ProducerRecord, SfuError> {
        self.producers
            .get_mut(producer_id)
            .ok_or_else(|| SfuError::UnknownProducer(producer_id.to_string()))
    }

    pub fn remove_producer(&mut self, producer_id: &str) -> Option<ProducerRecord> {
        self.producers.remove(producer_id)
    }

    #[must_use]
    pub fn owns_producer(&self, producer_id: &str) -> bool {
        self.producers.contains_key(producer_id)
    }

    pub fn producers(&self) -> impl Iterator<Item = (&String, &ProducerRecord)> {
        self.producers.iter()
    }

    /// Producer ids in a stable order.
    #[must_use]
    pub fn producer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.producers.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    #[must_use]
    pub fn has_consumer_for(&self, producer_id: &str) -> bool {
        self.consumer_by_producer.contains_key(producer_id)
    }

    pub fn add_consumer(&mut self, consumer_id: String, record: ConsumerRecord) {
        self.consumer_by_producer
            .insert(record.producer_id.clone(), consumer_id.clone());
        self.consumers.insert(consumer_id, record);
    }

    #[must_use]
    pub fn consumer(&self, consumer_id: &str) -> Option<&ConsumerRecord> {
        self.consumers.get(consumer_id)
    }

    pub fn consumer_mut(&mut self, consumer_id: &str) -> Option<&mut ConsumerRecord> {
        self.consumers.get_mut(consumer_id)
    }

    #[must_use]
    pub fn owns_consumer(&self, consumer_id: &str) -> bool {
        self.consumers.contains_key(consumer_id)
    }

    pub fn remove_consumer(&mut self, consumer_id: &str) -> Option<ConsumerRecord> {
        let record = self.consumers.remove(consumer_id)?;
        self.consumer_by_producer.remove(&record.producer_id);
        Some(record)
    }

    /// Remove the consumer of `producer_id`, returning its id.
    pub fn remove_consumer_of(&mut self, producer_id: &str) -> Option<String> {
        let consumer_id = self.consumer_by_producer.remove(producer_id)?;
        self.consumers.remove(&consumer_id);
        Some(consumer_id)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    // ------------------------------------------------------------------

    #[must_use]
    pub fn snapshot(&self) -> ParticipantSnapshot {
        let mut transports: Vec<TransportSnapshot> = self
            .transports
            .iter()
            .map(|(id, direction)| TransportSnapshot {
                id: id.clone(),
                direction: *direction,
            })
            .collect();
        transports.sort_by(|a, b| a.id.cmp(&b.id));

        let mut producers: Vec<ProducerSnapshot> = self
            .producers
            .iter()
            .map(|(id, p)| ProducerSnapshot {
                id: id.clone(),
                kind: p.kind,
                paused: p.paused,
            })
            .collect();
        producers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut consumers: Vec<ConsumerSnapshot> = self
            .consumers
            .iter()
            .map(|(id, c)| ConsumerSnapshot {
                id: id.clone(),
                producer_id: c.producer_id.clone(),
                producer_participant_id: c.producer_participant_id.clone(),
                kind: c.kind,
                client_paused: c.client_paused,
                producer_paused: c.producer_paused,
                acknowledged: c.acknowledged,
            })
            .collect();
        consumers.sort_by(|a, b| a.id.cmp(&b.id));

        ParticipantSnapshot {
            participant_id: self.participant_id.clone(),
            session_id: self.session_id,
            state: self.state,
            synced: self.synced,
            is_admin: self.grants.is_admin,
            joined_at: self.joined_at,
            transports,
            producers,
            consumers,
        }
    }

    /// Time since the session was added.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.added_at.elapsed()
    }
}
