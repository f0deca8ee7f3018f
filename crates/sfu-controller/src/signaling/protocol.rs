//! Signaling wire protocol.
//!
//! Every WebSocket text frame is a JSON object
//! `{"event": <name>, "data": <payload>, "id": <u64>?}`. A frame carrying
//! `id` expects an acknowledgement `{"event": "ack", "id": n, "data": ...}`
//! in the opposite direction. Payload keys are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::{AppData, MediaKind, TransportDescriptor};
use crate::errors::SfuError;

/// Event name of acknowledgement frames.
pub const ACK_EVENT: &str = "ack";

/// One signaling frame as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Frame {
    #[must_use]
    pub fn ack(id: u64, data: Value) -> Self {
        Self {
            event: ACK_EVENT.to_string(),
            data,
            id: Some(id),
        }
    }

    pub fn to_text(&self) -> Result<String, SfuError> {
        serde_json::to_string(self)
            .map_err(|e| SfuError::Signaling(format!("failed to encode frame: {e}")))
    }
}

// ----------------------------------------------------------------------------
// Client -> Server
// ----------------------------------------------------------------------------

/// Client device and capabilities, sent once to confirm the join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Opaque device description.
    #[serde(default)]
    pub device: Value,
    #[serde(default)]
    pub receive_capabilities: Option<Value>,
    #[serde(default)]
    pub data_capabilities: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub transport_id: String,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceParams {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: AppData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: String,
}

/// Inbound client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Config(ClientConfig),
    ConnectTransport(ConnectTransport),
    Produce(ProduceParams),
    ConsumersPaused(Vec<String>),
    ConsumersResumed(Vec<String>),
    ProducerClosed(ProducerRef),
    ProducerPaused(ProducerRef),
    ProducerResumed(ProducerRef),
}

impl ClientEvent {
    /// Wire name, used for logs and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::Config(_) => "config",
            ClientEvent::ConnectTransport(_) => "connect-transport",
            ClientEvent::Produce(_) => "produce",
            ClientEvent::ConsumersPaused(_) => "consumers-paused",
            ClientEvent::ConsumersResumed(_) => "consumers-resumed",
            ClientEvent::ProducerClosed(_) => "producer-closed",
            ClientEvent::ProducerPaused(_) => "producer-paused",
            ClientEvent::ProducerResumed(_) => "producer-resumed",
        }
    }

    /// Decode the event carried by a frame.
    pub fn from_frame(event: &str, data: Value) -> Result<Self, SfuError> {
        serde_json::from_value(json!({ "event": event, "data": data }))
            .map_err(|e| SfuError::Signaling(format!("invalid '{event}' event: {e}")))
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event { event: ClientEvent, id: Option<u64> },
    Ack { id: u64, data: Value },
}

/// Parse one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, SfuError> {
    let frame: Frame = serde_json::from_str(text)
        .map_err(|e| SfuError::Signaling(format!("malformed frame: {e}")))?;

    if frame.event == ACK_EVENT {
        let id = frame
            .id
            .ok_or_else(|| SfuError::Signaling("ack without id".to_string()))?;
        return Ok(Inbound::Ack {
            id,
            data: frame.data,
        });
    }

    let event = ClientEvent::from_frame(&frame.event, frame.data)?;
    Ok(Inbound::Event {
        event,
        id: frame.id,
    })
}

// ----------------------------------------------------------------------------
// Server -> Client
// ----------------------------------------------------------------------------

/// Initial negotiation data sent on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub router_capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_transport: Option<TransportDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_transport: Option<TransportDescriptor>,
}

/// Asks the client to create a local consumer. Acked with a boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MakeConsumer {
    pub peer_id: String,
    pub producer_id: String,
    pub consumer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub app_data: AppData,
    pub producer_paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub id: String,
    pub score: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayersChanged {
    pub consumer_id: String,
    pub spatial_layer: Option<u8>,
    pub temporal_layer: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRef {
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: String,
}

/// Loudest participant, or `None` on silence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSpeaker {
    pub participant_id: Option<String>,
    pub volume: Option<i8>,
}

/// Outbound server event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Config(ServerConfig),
    /// Ids of participants already joined. Acked before fan-out.
    Joined(Vec<String>),
    MakeConsumer(MakeConsumer),
    ProducerScore(ScoreReport),
    ConsumerScore(ScoreReport),
    ConsumerLayersChanged(LayersChanged),
    ParticipantJoined(ParticipantRef),
    ParticipantLeft(ParticipantRef),
    ConsumerClosed(ConsumerRef),
    ConsumerPaused(ConsumerRef),
    ConsumerResumed(ConsumerRef),
    ActiveSpeaker(ActiveSpeaker),
}

impl ServerEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::Config(_) => "config",
            ServerEvent::Joined(_) => "joined",
            ServerEvent::MakeConsumer(_) => "make-consumer",
            ServerEvent::ProducerScore(_) => "producer-score",
            ServerEvent::ConsumerScore(_) => "consumer-score",
            ServerEvent::ConsumerLayersChanged(_) => "consumer-layers-changed",
            ServerEvent::ParticipantJoined(_) => "participant-joined",
            ServerEvent::ParticipantLeft(_) => "participant-left",
            ServerEvent::ConsumerClosed(_) => "consumer-closed",
            ServerEvent::ConsumerPaused(_) => "consumer-paused",
            ServerEvent::ConsumerResumed(_) => "consumer-resumed",
            ServerEvent::ActiveSpeaker(_) => "active-speaker",
        }
    }

    /// Encode as a wire frame, optionally expecting an acknowledgement.
    pub fn to_frame(&self, id: Option<u64>) -> Result<Frame, SfuError> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| SfuError::Signaling(format!("failed to encode event: {e}")))?;
        let data = value
            .get_mut("data")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Frame {
            event: self.name().to_string(),
            data,
            id,
        })
    }
}
