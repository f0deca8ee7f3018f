//! mediasoup adapter.
//!
//! Each worker gets its own WebRTC server on a dedicated UDP port, and
//! every transport on that worker shares it. Routers keep their
//! transports, producers and consumers in an id-keyed map; dropping a
//! mediasoup object closes it, so closing means removing from the map.
//!
//! mediasoup callbacks run on the worker's channel thread. They only
//! forward [`EngineEvent`]s into the room's sink and prune closed objects
//! from the map.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU16, NonZeroU32, NonZeroU8};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mediasoup::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions};
use mediasoup::prelude::*;
use mediasoup::producer::ProducerId;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    AudioVolume, ConsumeRequest, ConsumerCloseCause, ConsumerDescriptor, ConsumerLayers,
    EngineError, EngineEvent, EngineEventSink, EngineWorker, MediaEngine,
    MediaKind as EngineMediaKind, MediaRouter, ProduceRequest, TransportDescriptor,
    TransportDirection, WorkerSettings as EngineWorkerSettings, WorkerUsage,
};

/// Audio-level observer reporting interval in milliseconds.
const AUDIO_LEVEL_INTERVAL_MS: u16 = 800;

/// Volumes below this dBvo count as silence.
const AUDIO_LEVEL_THRESHOLD: i8 = -80;

fn nonzero_u32(value: u32) -> Result<NonZeroU32, EngineError> {
    NonZeroU32::new(value).ok_or_else(|| EngineError::Router(format!("invalid value {value}")))
}

/// Codecs offered by every router.
fn media_codecs() -> Result<Vec<RtpCodecCapability>, EngineError> {
    let video_feedback = || {
        vec![
            RtcpFeedback::Nack,
            RtcpFeedback::NackPli,
            RtcpFeedback::CcmFir,
            RtcpFeedback::GoogRemb,
            RtcpFeedback::TransportCc,
        ]
    };

    Ok(vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: nonzero_u32(48_000)?,
            channels: NonZeroU8::new(2)
                .ok_or_else(|| EngineError::Router("invalid channel count".to_string()))?,
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: nonzero_u32(90_000)?,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: None,
            clock_rate: nonzero_u32(90_000)?,
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: video_feedback(),
        },
    ])
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn from_json<T: serde::de::DeserializeOwned>(
    value: Value,
    what: &str,
) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| EngineError::NotFound(format!("invalid {what}: {e}")))
}

fn engine_kind(kind: MediaKind) -> EngineMediaKind {
    match kind {
        MediaKind::Audio => EngineMediaKind::Audio,
        MediaKind::Video => EngineMediaKind::Video,
    }
}

fn mediasoup_kind(kind: EngineMediaKind) -> MediaKind {
    match kind {
        EngineMediaKind::Audio => MediaKind::Audio,
        EngineMediaKind::Video => MediaKind::Video,
    }
}

/// Spawns mediasoup worker processes.
pub struct MediasoupEngine {
    manager: mediasoup::worker_manager::WorkerManager,
}

impl MediasoupEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            manager: mediasoup::worker_manager::WorkerManager::new(),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_worker(
        &self,
        settings: EngineWorkerSettings,
    ) -> Result<Arc<dyn EngineWorker>, EngineError> {
        let mut worker_settings = WorkerSettings::default();
        worker_settings.rtc_port_range = settings.rtc_min_port..=settings.rtc_max_port;

        let worker = self
            .manager
            .create_worker(worker_settings)
            .await
            .map_err(|e| EngineError::Worker(format!("failed to create worker: {e}")))?;

        let listen_info = ListenInfo {
            protocol: Protocol::Udp,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: settings.announced_address.clone(),
            port: Some(settings.webrtc_port),
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        };
        let webrtc_server = worker
            .create_webrtc_server(WebRtcServerOptions::new(WebRtcServerListenInfos::new(
                listen_info,
            )))
            .await
            .map_err(|e| {
                EngineError::Worker(format!(
                    "failed to create WebRTC server on port {}: {e}",
                    settings.webrtc_port
                ))
            })?;

        let (death_tx, death_rx) = watch::channel(None);
        worker
            .on_dead(move |reason| {
                let _ = death_tx.send(Some(format!("{reason:?}")));
            })
            .detach();

        debug!(
            target: "sfu.engine",
            worker = settings.index,
            worker_id = %worker.id(),
            "mediasoup worker created"
        );

        Ok(Arc::new(MediasoupWorker {
            worker,
            webrtc_server,
            death_rx,
        }))
    }
}

struct MediasoupWorker {
    worker: Worker,
    webrtc_server: WebRtcServer,
    death_rx: watch::Receiver<Option<String>>,
}

#[async_trait::async_trait]
impl EngineWorker for MediasoupWorker {
    fn id(&self) -> String {
        self.worker.id().to_string()
    }

    async fn resource_usage(&self) -> Result<WorkerUsage, EngineError> {
        let usage = self
            .worker
            .get_resource_usage()
            .await
            .map_err(|e| EngineError::Worker(format!("resource usage: {e}")))?;
        Ok(WorkerUsage {
            cpu_time: Duration::from_millis(usage.ru_utime.saturating_add(usage.ru_stime)),
        })
    }

    async fn create_router(
        &self,
        events: EngineEventSink,
    ) -> Result<Box<dyn MediaRouter>, EngineError> {
        let router = self
            .worker
            .create_router(RouterOptions::new(media_codecs()?))
            .await
            .map_err(|e| EngineError::Router(format!("failed to create router: {e}")))?;

        Ok(Box::new(MediasoupRouter {
            id: router.id().to_string(),
            capabilities: to_json(router.rtp_capabilities()),
            router: Mutex::new(Some(router)),
            webrtc_server: self.webrtc_server.clone(),
            events,
            objects: Arc::new(Mutex::new(RouterObjects::default())),
            audio_observer: Mutex::new(None),
        }))
    }

    async fn died(&self) -> String {
        let mut rx = self.death_rx.clone();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "worker handle dropped".to_string(),
        };
        reason
    }
}

/// Which transport each producer and consumer was created on.
///
/// mediasoup keeps a transport open while any of its producers or
/// consumers is alive, so closing a transport has to drop those too.
#[derive(Debug, Default)]
struct TransportOwnership {
    owner_of: HashMap<String, String>,
}

impl TransportOwnership {
    fn record(&mut self, object_id: &str, transport_id: &str) {
        self.owner_of
            .insert(object_id.to_string(), transport_id.to_string());
    }

    fn forget(&mut self, object_id: &str) {
        self.owner_of.remove(object_id);
    }

    /// Forget and return every object created on `transport_id`.
    fn release(&mut self, transport_id: &str) -> Vec<String> {
        let mut owned: Vec<String> = self
            .owner_of
            .iter()
            .filter(|(_, owner)| owner.as_str() == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        owned.sort();
        for id in &owned {
            self.owner_of.remove(id);
        }
        owned
    }
}

#[derive(Default)]
struct RouterObjects {
    transports: HashMap<String, WebRtcTransport>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
    consumer_scores: HashMap<String, Value>,
    ownership: TransportOwnership,
}

type SharedObjects = Arc<Mutex<RouterObjects>>;

fn lock(objects: &SharedObjects) -> std::sync::MutexGuard<'_, RouterObjects> {
    objects.lock().unwrap_or_else(|e| e.into_inner())
}

struct MediasoupRouter {
    id: String,
    capabilities: Value,
    /// `None` once closed.
    router: Mutex<Option<Router>>,
    webrtc_server: WebRtcServer,
    events: EngineEventSink,
    objects: SharedObjects,
    audio_observer: Mutex<Option<AudioLevelObserver>>,
}

impl MediasoupRouter {
    fn router(&self) -> Result<Router, EngineError> {
        self.router
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| EngineError::Router(format!("router {} is closed", self.id)))
    }

    fn transport(&self, transport_id: &str) -> Result<WebRtcTransport, EngineError> {
        lock(&self.objects)
            .transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))
    }

    fn producer(&self, producer_id: &str) -> Result<Producer, EngineError> {
        lock(&self.objects)
            .producers
            .get(producer_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))
    }

    fn consumer(&self, consumer_id: &str) -> Result<Consumer, EngineError> {
        lock(&self.objects)
            .consumers
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))
    }

    fn watch_producer(&self, producer: &Producer) {
        let producer_id = producer.id().to_string();

        producer
            .on_transport_close({
                let events = self.events.clone();
                let objects = Arc::clone(&self.objects);
                let producer_id = producer_id.clone();
                move || {
                    let removed = {
                        let mut objects = lock(&objects);
                        objects.ownership.forget(&producer_id);
                        objects.producers.remove(&producer_id)
                    };
                    drop(removed);
                    let _ = events.send(EngineEvent::ProducerClosed {
                        producer_id: producer_id.clone(),
                    });
                }
            })
            .detach();

        producer
            .on_score({
                let events = self.events.clone();
                move |scores| {
                    let _ = events.send(EngineEvent::ProducerScore {
                        producer_id: producer_id.clone(),
                        score: to_json(scores),
                    });
                }
            })
            .detach();
    }

    fn watch_consumer(&self, consumer: &Consumer) {
        let consumer_id = consumer.id().to_string();

        let on_closed = |cause: ConsumerCloseCause| {
            let events = self.events.clone();
            let objects = Arc::clone(&self.objects);
            let consumer_id = consumer_id.clone();
            move || {
                let removed = {
                    let mut objects = lock(&objects);
                    objects.ownership.forget(&consumer_id);
                    objects.consumer_scores.remove(&consumer_id);
                    objects.consumers.remove(&consumer_id)
                };
                drop(removed);
                let _ = events.send(EngineEvent::ConsumerClosed {
                    consumer_id: consumer_id.clone(),
                    cause,
                });
            }
        };
        consumer
            .on_producer_close(on_closed(ConsumerCloseCause::ProducerClosed))
            .detach();
        consumer
            .on_transport_close(on_closed(ConsumerCloseCause::TransportClosed))
            .detach();

        consumer
            .on_producer_pause({
                let events = self.events.clone();
                let consumer_id = consumer_id.clone();
                move || {
                    let _ = events.send(EngineEvent::ConsumerProducerPaused {
                        consumer_id: consumer_id.clone(),
                    });
                }
            })
            .detach();

        consumer
            .on_producer_resume({
                let events = self.events.clone();
                let consumer_id = consumer_id.clone();
                move || {
                    let _ = events.send(EngineEvent::ConsumerProducerResumed {
                        consumer_id: consumer_id.clone(),
                    });
                }
            })
            .detach();

        consumer
            .on_score({
                let events = self.events.clone();
                let objects = Arc::clone(&self.objects);
                let consumer_id = consumer_id.clone();
                move |score| {
                    let score = to_json(score);
                    lock(&objects)
                        .consumer_scores
                        .insert(consumer_id.clone(), score.clone());
                    let _ = events.send(EngineEvent::ConsumerScore {
                        consumer_id: consumer_id.clone(),
                        score,
                    });
                }
            })
            .detach();

        consumer
            .on_layers_change({
                let events = self.events.clone();
                move |layers| {
                    let _ = events.send(EngineEvent::ConsumerLayersChanged {
                        consumer_id: consumer_id.clone(),
                        layers: layers.as_ref().map(|l| ConsumerLayers {
                            spatial_layer: l.spatial_layer,
                            temporal_layer: l.temporal_layer,
                        }),
                    });
                }
            })
            .detach();
    }
}

#[async_trait::async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        self.capabilities.clone()
    }

    fn close(&self) {
        let router = self.router.lock().unwrap_or_else(|e| e.into_inner()).take();
        if router.is_none() {
            return;
        }

        let observer = self
            .audio_observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let objects = std::mem::take(&mut *lock(&self.objects));

        // Drop consumers before producers before transports
        drop(objects.consumers);
        drop(objects.producers);
        drop(objects.transports);
        drop(observer);
        drop(router);

        info!(target: "sfu.engine", router_id = %self.id, "Router closed");
    }

    async fn create_audio_level_observer(&self) -> Result<(), EngineError> {
        let router = self.router()?;

        let mut options = AudioLevelObserverOptions::default();
        options.max_entries = NonZeroU16::MIN;
        options.threshold = AUDIO_LEVEL_THRESHOLD;
        options.interval = AUDIO_LEVEL_INTERVAL_MS;

        let observer = router
            .create_audio_level_observer(options)
            .await
            .map_err(|e| EngineError::Observer(format!("failed to create observer: {e}")))?;

        observer
            .on_volumes({
                let events = self.events.clone();
                move |volumes| {
                    let volumes = volumes
                        .iter()
                        .map(|v| AudioVolume {
                            producer_id: v.producer.id().to_string(),
                            volume: v.volume,
                        })
                        .collect();
                    let _ = events.send(EngineEvent::AudioVolumes { volumes });
                }
            })
            .detach();

        observer
            .on_silence({
                let events = self.events.clone();
                move || {
                    let _ = events.send(EngineEvent::Silence);
                }
            })
            .detach();

        *self
            .audio_observer
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(observer);
        Ok(())
    }

    async fn observe_audio(&self, producer_id: &str) -> Result<(), EngineError> {
        let observer = self
            .audio_observer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| EngineError::Observer("no audio level observer".to_string()))?;
        let producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| EngineError::NotFound(format!("producer {producer_id}")))?;

        observer
            .add_producer(RtpObserverAddProducerOptions::new(producer_id))
            .await
            .map_err(|e| EngineError::Observer(format!("failed to observe producer: {e}")))
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError> {
        let router = self.router()?;

        let mut options = WebRtcTransportOptions::new_with_server(self.webrtc_server.clone());
        options.app_data = AppData::new(direction);

        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| EngineError::Transport(format!("failed to create transport: {e}")))?;

        let descriptor = TransportDescriptor {
            id: transport.id().to_string(),
            ice_parameters: to_json(transport.ice_parameters()),
            ice_candidates: to_json(transport.ice_candidates()),
            dtls_parameters: to_json(&transport.dtls_parameters()),
            sctp_parameters: transport.sctp_parameters().map(|p| to_json(&p)),
        };

        lock(&self.objects)
            .transports
            .insert(descriptor.id.clone(), transport);
        Ok(descriptor)
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError> {
        let transport = self.transport(transport_id)?;
        let dtls_parameters: DtlsParameters = from_json(dtls_parameters, "DTLS parameters")?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| EngineError::Transport(format!("failed to connect transport: {e}")))
    }

    fn close_transport(&self, transport_id: &str) {
        let (transport, consumers, producers) = {
            let mut objects = lock(&self.objects);
            let Some(transport) = objects.transports.remove(transport_id) else {
                return;
            };
            let mut consumers = Vec::new();
            let mut producers = Vec::new();
            for object_id in objects.ownership.release(transport_id) {
                objects.consumer_scores.remove(&object_id);
                if let Some(consumer) = objects.consumers.remove(&object_id) {
                    consumers.push(consumer);
                } else if let Some(producer) = objects.producers.remove(&object_id) {
                    producers.push(producer);
                }
            }
            (transport, consumers, producers)
        };

        for consumer in &consumers {
            let _ = self.events.send(EngineEvent::ConsumerClosed {
                consumer_id: consumer.id().to_string(),
                cause: ConsumerCloseCause::TransportClosed,
            });
        }
        for producer in &producers {
            let _ = self.events.send(EngineEvent::ProducerClosed {
                producer_id: producer.id().to_string(),
            });
        }

        debug!(
            target: "sfu.engine",
            router_id = %self.id,
            transport_id = %transport_id,
            consumers = consumers.len(),
            producers = producers.len(),
            "Transport closed"
        );
        // Last handles go here, which lets mediasoup close the transport
        drop(consumers);
        drop(producers);
        drop(transport);
    }

    async fn produce(&self, request: ProduceRequest) -> Result<String, EngineError> {
        let transport = self.transport(&request.transport_id)?;
        let rtp_parameters: RtpParameters = from_json(request.rtp_parameters, "RTP parameters")?;

        let mut options = ProducerOptions::new(mediasoup_kind(request.kind), rtp_parameters);
        options.app_data = AppData::new(request.app_data);

        let producer = transport
            .produce(options)
            .await
            .map_err(|e| EngineError::Producer(format!("failed to produce: {e}")))?;

        let producer_id = producer.id().to_string();
        self.watch_producer(&producer);
        let mut objects = lock(&self.objects);
        objects
            .ownership
            .record(&producer_id, &request.transport_id);
        objects.producers.insert(producer_id.clone(), producer);
        drop(objects);
        Ok(producer_id)
    }

    fn close_producer(&self, producer_id: &str) {
        let removed = {
            let mut objects = lock(&self.objects);
            objects.ownership.forget(producer_id);
            objects.producers.remove(producer_id)
        };
        drop(removed);
    }

    async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.producer(producer_id)?
            .pause()
            .await
            .map_err(|e| EngineError::Producer(format!("failed to pause producer: {e}")))
    }

    async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.producer(producer_id)?
            .resume()
            .await
            .map_err(|e| EngineError::Producer(format!("failed to resume producer: {e}")))
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(router) = self.router() else {
            return false;
        };
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        match serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) {
            Ok(capabilities) => router.can_consume(&producer_id, &capabilities),
            Err(e) => {
                warn!(
                    target: "sfu.engine",
                    router_id = %self.id,
                    error = %e,
                    "Unparseable receive capabilities"
                );
                false
            }
        }
    }

    async fn consume(&self, request: ConsumeRequest) -> Result<ConsumerDescriptor, EngineError> {
        let transport = self.transport(&request.transport_id)?;
        let producer_id: ProducerId = request
            .producer_id
            .parse()
            .map_err(|_| EngineError::NotFound(format!("producer {}", request.producer_id)))?;
        let capabilities: RtpCapabilities =
            from_json(request.rtp_capabilities, "RTP capabilities")?;

        let mut options = ConsumerOptions::new(producer_id, capabilities);
        options.paused = request.paused;

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| EngineError::Consumer(format!("failed to consume: {e}")))?;

        let descriptor = ConsumerDescriptor {
            id: consumer.id().to_string(),
            producer_id: request.producer_id,
            kind: engine_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters()),
            consumer_type: to_json(&consumer.r#type())
                .as_str()
                .unwrap_or("simple")
                .to_string(),
            producer_paused: consumer.producer_paused(),
        };

        self.watch_consumer(&consumer);
        let mut objects = lock(&self.objects);
        objects
            .ownership
            .record(&descriptor.id, &request.transport_id);
        objects.consumers.insert(descriptor.id.clone(), consumer);
        drop(objects);
        Ok(descriptor)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.consumer(consumer_id)?
            .pause()
            .await
            .map_err(|e| EngineError::Consumer(format!("failed to pause consumer: {e}")))
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.consumer(consumer_id)?
            .resume()
            .await
            .map_err(|e| EngineError::Consumer(format!("failed to resume consumer: {e}")))
    }

    fn consumer_score(&self, consumer_id: &str) -> Option<Value> {
        let objects = lock(&self.objects);
        if let Some(score) = objects.consumer_scores.get(consumer_id) {
            return Some(score.clone());
        }
        objects
            .consumers
            .get(consumer_id)
            .map(|consumer| to_json(&consumer.score()))
    }
}
