//! Message types for actor communication.
//!
//! Every request that needs an answer carries a `respond_to` oneshot.
//! Handles wrap these so callers see plain async methods.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::room::RoomHandle;
use crate::engine::{EngineEventStream, MediaKind, MediaRouter, TransportDirection};
use crate::errors::SfuError;
use crate::permissions::Grants;
use crate::signaling::protocol::ClientEvent;
use crate::signaling::{Responder, SignalingChannel};

// ============================================================================
// Registry messages
// ============================================================================

/// Messages handled by the `RoomRegistryActor`.
pub enum RegistryMessage {
    /// Return the room for an id, creating it if absent.
    ///
    /// Concurrent callers for the same id all receive the same room.
    GetOrCreate {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomHandle, SfuError>>,
    },

    /// Return an existing room only.
    Get {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomHandle, SfuError>>,
    },

    /// Close a room and remove it. Closing an absent room is a no-op.
    Close {
        room_id: String,
        respond_to: oneshot::Sender<()>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and close every live room, waiting at most `deadline`.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<()>,
    },

    /// Internal: a spawned room creation finished.
    RoomCreated {
        room_id: String,
        creation_id: Uuid,
        result: Result<CreatedRoom, SfuError>,
    },

    /// Internal: a room emptied and closed itself.
    RoomEmptied { room_id: String, incarnation: Uuid },
}

impl RegistryMessage {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            RegistryMessage::GetOrCreate { .. } => "get_or_create",
            RegistryMessage::Get { .. } => "get",
            RegistryMessage::Close { .. } => "close",
            RegistryMessage::GetStatus { .. } => "get_status",
            RegistryMessage::Shutdown { .. } => "shutdown",
            RegistryMessage::RoomCreated { .. } => "room_created",
            RegistryMessage::RoomEmptied { .. } => "room_emptied",
        }
    }
}

/// Engine resources for a new room, built outside the registry loop.
pub struct CreatedRoom {
    pub router: Box<dyn MediaRouter>,
    pub events: EngineEventStream,
    pub worker_index: usize,
}

/// Registry status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub room_count: usize,
    /// Rooms whose engine resources are still being created.
    pub creating_count: usize,
    pub participant_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

// ============================================================================
// Room messages
// ============================================================================

/// Messages handled by a `RoomActor`.
pub enum RoomMessage {
    /// Add a participant in `Pending` state and send it the room config.
    AddParticipant {
        participant_id: String,
        channel: Arc<dyn SignalingChannel>,
        options: JoinOptions,
        respond_to: oneshot::Sender<Result<AddOutcome, SfuError>>,
    },

    /// Client event from a participant's socket.
    ///
    /// `responder` is set when the client asked for a reply.
    ClientEvent {
        participant_id: String,
        session_id: Uuid,
        event: ClientEvent,
        responder: Option<Responder>,
    },

    /// The participant's connection closed.
    Disconnect {
        participant_id: String,
        session_id: Uuid,
        reason: DisconnectReason,
    },

    /// Internal: the client acknowledged its `joined` roster.
    JoinAcknowledged {
        participant_id: String,
        session_id: Uuid,
    },

    /// Internal: the client acknowledged a `make-consumer`.
    ConsumerAcknowledged {
        participant_id: String,
        session_id: Uuid,
        consumer_id: String,
        accepted: bool,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

impl RoomMessage {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RoomMessage::AddParticipant { .. } => "add_participant",
            RoomMessage::ClientEvent { event, .. } => event.name(),
            RoomMessage::Disconnect { .. } => "disconnect",
            RoomMessage::JoinAcknowledged { .. } => "joined_ack",
            RoomMessage::ConsumerAcknowledged { .. } => "make_consumer_ack",
            RoomMessage::GetState { .. } => "get_state",
        }
    }
}

/// Per-connection options resolved by the gateway.
#[derive(Debug, Clone)]
pub struct JoinOptions {
    /// Deployment switch; when off no producer transport is created.
    pub allow_produce: bool,
    /// Deployment switch; when off no consumer transport is created.
    pub allow_consume: bool,
    pub grants: Grants,
}

/// Result of adding a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added { session_id: Uuid },
    /// A session with this participant id is already in the room.
    AlreadyPresent,
}

/// Why a participant's session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    TransportError,
    ServerShutdown,
}

impl DisconnectReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::TransportError => "transport_error",
            DisconnectReason::ServerShutdown => "server_shutdown",
        }
    }
}

// ============================================================================
// Room state snapshots
// ============================================================================

/// Participant lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transports created, waiting for the client `config`.
    Pending,
    /// Client capabilities received; visible to the room.
    Joined,
    /// Terminal. Removed from the room.
    Disconnected,
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    pub incarnation: Uuid,
    pub router_id: String,
    pub active_speaker: Option<String>,
    /// Sorted by participant id.
    pub participants: Vec<ParticipantSnapshot>,
}

impl RoomState {
    #[must_use]
    pub fn participant(&self, participant_id: &str) -> Option<&ParticipantSnapshot> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSnapshot {
    pub participant_id: String,
    pub session_id: Uuid,
    pub state: SessionState,
    /// The client acknowledged its roster and received the initial consumers.
    pub synced: bool,
    pub is_admin: bool,
    /// Wall-clock time the session was added to the room.
    pub joined_at: DateTime<Utc>,
    pub transports: Vec<TransportSnapshot>,
    pub producers: Vec<ProducerSnapshot>,
    pub consumers: Vec<ConsumerSnapshot>,
}

impl ParticipantSnapshot {
    /// Consumer of `producer_id`, if this participant has one.
    #[must_use]
    pub fn consumer_of(&self, producer_id: &str) -> Option<&ConsumerSnapshot> {
        self.consumers.iter().find(|c| c.producer_id == producer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSnapshot {
    pub id: String,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSnapshot {
    pub id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSnapshot {
    pub id: String,
    pub producer_id: String,
    pub producer_participant_id: String,
    pub kind: MediaKind,
    /// Paused by the client.
    pub client_paused: bool,
    pub producer_paused: bool,
    /// The client acknowledged `make-consumer`; engine pause state follows `client_paused` from then on.
    pub acknowledged: bool,
}

/// Reply value for a client event that succeeded without a payload.
#[must_use]
pub fn ok_reply() -> Value {
    Value::Bool(true)
}
