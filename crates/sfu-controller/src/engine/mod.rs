//! Media engine boundary.
//!
//! The orchestration core never names a concrete engine. Workers, routers,
//! transports, producers and consumers are reached through the object-safe
//! traits below and addressed by string id. Engine payloads (RTP
//! capabilities and parameters, ICE and DTLS parameters, scores) pass
//! through as opaque JSON.
//!
//! Engine notifications never call into room state. Adapters push
//! [`EngineEvent`] values into the per-room [`EngineEventSink`]; the room
//! actor drains them in the same loop as its mailbox.

#[cfg(feature = "mediasoup")]
pub mod mediasoup;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::errors::SfuError;

/// Router RTP capabilities or client receive capabilities. Engine-defined.
pub type RtpCapabilities = Value;

/// Open key-value bag carried with producers at the protocol boundary.
pub type AppData = serde_json::Map<String, Value>;

/// Per-room notification channel from the engine into the room actor.
pub type EngineEventSink = mpsc::UnboundedSender<EngineEvent>;

/// Receiving side of [`EngineEventSink`], owned by the room actor.
pub type EngineEventStream = mpsc::UnboundedReceiver<EngineEvent>;

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction tag stored in transport app data as `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Producer,
    Consumer,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Producer => "producer",
            TransportDirection::Consumer => "consumer",
        }
    }
}

/// Everything the client needs to create the matching local transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sctp_parameters: Option<Value>,
}

/// Producer creation request on a producer-direction transport.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: AppData,
}

/// Consumer creation request on a consumer-direction transport.
#[derive(Debug, Clone)]
pub struct ConsumeRequest {
    pub transport_id: String,
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
    /// Consumers are created paused and resumed after the client acks.
    pub paused: bool,
}

/// Result of a successful consume.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerDescriptor {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    /// Engine consumer type (`simple`, `simulcast`, `svc`, `pipe`).
    pub consumer_type: String,
    pub producer_paused: bool,
}

/// Active simulcast/SVC layers of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    pub temporal_layer: Option<u8>,
}

/// Why the engine closed a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerCloseCause {
    ProducerClosed,
    TransportClosed,
}

/// One entry of an audio-level report.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioVolume {
    pub producer_id: String,
    /// dBvo, -127..=0.
    pub volume: i8,
}

/// Engine notification delivered to the owning room.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A producer closed on the engine side (its transport closed).
    ProducerClosed { producer_id: String },
    ProducerScore { producer_id: String, score: Value },
    ConsumerClosed {
        consumer_id: String,
        cause: ConsumerCloseCause,
    },
    ConsumerProducerPaused { consumer_id: String },
    ConsumerProducerResumed { consumer_id: String },
    ConsumerScore { consumer_id: String, score: Value },
    ConsumerLayersChanged {
        consumer_id: String,
        layers: Option<ConsumerLayers>,
    },
    /// Loudest producers first.
    AudioVolumes { volumes: Vec<AudioVolume> },
    Silence,
}

impl EngineEvent {
    /// Event name for logs and failure metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            EngineEvent::ProducerClosed { .. } => "engine.producer_closed",
            EngineEvent::ProducerScore { .. } => "engine.producer_score",
            EngineEvent::ConsumerClosed { .. } => "engine.consumer_closed",
            EngineEvent::ConsumerProducerPaused { .. } => "engine.consumer_producer_paused",
            EngineEvent::ConsumerProducerResumed { .. } => "engine.consumer_producer_resumed",
            EngineEvent::ConsumerScore { .. } => "engine.consumer_score",
            EngineEvent::ConsumerLayersChanged { .. } => "engine.consumer_layers_changed",
            EngineEvent::AudioVolumes { .. } => "engine.audio_volumes",
            EngineEvent::Silence => "engine.silence",
        }
    }
}

/// Per-worker creation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Pool index of the worker.
    pub index: usize,
    /// Port of the worker's WebRTC server.
    pub webrtc_port: u16,
    pub announced_address: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

/// Cumulative process resource usage of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerUsage {
    /// User plus system CPU time since the worker started.
    pub cpu_time: Duration,
}

/// Engine call failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("worker: {0}")]
    Worker(String),

    #[error("router: {0}")]
    Router(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("producer: {0}")]
    Producer(String),

    #[error("consumer: {0}")]
    Consumer(String),

    #[error("observer: {0}")]
    Observer(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        SfuError::Engine(err.to_string())
    }
}

/// Factory for engine worker processes.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Start a worker and its WebRTC server.
    async fn create_worker(
        &self,
        settings: WorkerSettings,
    ) -> Result<Arc<dyn EngineWorker>, EngineError>;
}

/// A running engine worker.
#[async_trait::async_trait]
pub trait EngineWorker: Send + Sync {
    fn id(&self) -> String;

    /// Cumulative CPU usage of the worker process.
    async fn resource_usage(&self) -> Result<WorkerUsage, EngineError>;

    /// Create a routing context. Its notifications go to `events`.
    async fn create_router(
        &self,
        events: EngineEventSink,
    ) -> Result<Box<dyn MediaRouter>, EngineError>;

    /// Resolves with a reason once the worker terminates unexpectedly.
    async fn died(&self) -> String;
}

/// One routing context, exclusively owned by one room.
#[async_trait::async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> String;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Close the router and everything created on it. Idempotent.
    fn close(&self);

    async fn create_audio_level_observer(&self) -> Result<(), EngineError>;

    /// Add an audio producer to the audio-level observer.
    async fn observe_audio(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError>;

    /// Close a transport. Producers and consumers on it close with it and
    /// report through the event sink.
    fn close_transport(&self, transport_id: &str);

    /// Returns the new producer id.
    async fn produce(&self, request: ProduceRequest) -> Result<String, EngineError>;

    /// Close a producer. Its consumers close with it.
    fn close_producer(&self, producer_id: &str);

    async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError>;

    /// Capability compatibility check between a producer and receive caps.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn consume(&self, request: ConsumeRequest) -> Result<ConsumerDescriptor, EngineError>;

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    /// Latest known quality score of a consumer.
    fn consumer_score(&self, consumer_id: &str) -> Option<Value>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_media_kind_wire_names() {
        assert_eq!(serde_json::to_value(MediaKind::Audio).unwrap(), json!("audio"));
        let kind: MediaKind = serde_json::from_value(json!("video")).unwrap();
        assert_eq!(kind, MediaKind::Video);
        assert!(serde_json::from_value::<MediaKind>(json!("data")).is_err());
    }

    #[test]
    fn test_transport_descriptor_is_camel_case() {
        let descriptor = TransportDescriptor {
            id: "t-1".to_string(),
            ice_parameters: json!({"usernameFragment": "u"}),
            ice_candidates: json!([]),
            dtls_parameters: json!({"role": "auto"}),
            sctp_parameters: None,
        };

        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["iceParameters"]["usernameFragment"], "u");
        assert!(value.get("dtlsParameters").is_some());
        assert!(value.get("sctpParameters").is_none());
    }

    #[test]
    fn test_engine_error_converts_to_transient() {
        let err: SfuError = EngineError::Consumer("incompatible".to_string()).into();
        assert!(matches!(err, SfuError::Engine(ref m) if m == "consumer: incompatible"));
        assert_eq!(err.class(), crate::errors::ErrorClass::Transient);
    }
}
