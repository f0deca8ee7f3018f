//! In-memory media engine.
//!
//! Behaves like the native engine as far as the orchestration layer can
//! observe:
//! - Closing a transport closes its producers and consumers, and closing a
//!   producer closes its consumers. Each closure is reported through the
//!   router's event sink the way the native engine reports it.
//! - Pausing a producer reports `ConsumerProducerPaused` on its consumers.
//! - `can_consume` is true when the capabilities list a codec of the
//!   producer's kind: `{"codecs": [{"kind": "audio"}, ...]}`.
//!
//! Failures can be injected per router (transport creation, produce,
//! consume, observer) and per worker (router creation, usage reads).
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockEngine;
//!
//! let engine = MockEngine::new();
//! let pool = WorkerPool::create(engine.clone(), settings, cancel).await?;
//!
//! engine.worker(0).add_cpu_time(Duration::from_secs(2));
//! engine.worker(1).kill("segfault");
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use sfu_controller::engine::{
    AudioVolume, ConsumeRequest, ConsumerCloseCause, ConsumerDescriptor, EngineError,
    EngineEvent, EngineEventSink, EngineWorker, MediaEngine, MediaKind, MediaRouter,
    ProduceRequest, RtpCapabilities, TransportDescriptor, TransportDirection, WorkerSettings,
    WorkerUsage,
};
use tokio::sync::watch;

/// Capabilities able to receive both kinds.
#[must_use]
pub fn full_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus" },
            { "kind": "video", "mimeType": "video/VP8" },
        ]
    })
}

/// Capabilities able to receive one kind only.
#[must_use]
pub fn capabilities_for(kind: MediaKind) -> Value {
    json!({ "codecs": [ { "kind": kind.as_str() } ] })
}

fn supports(capabilities: &Value, kind: MediaKind) -> bool {
    capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .is_some_and(|codecs| {
            codecs
                .iter()
                .any(|c| c.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
        })
}

// ============================================================================
// Engine
// ============================================================================

/// Mock engine. Keeps every worker it created for inspection.
#[derive(Default)]
pub struct MockEngine {
    workers: Mutex<Vec<Arc<MockWorker>>>,
    fail_creation: AtomicBool,
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent `create_worker` calls fail.
    pub fn fail_worker_creation(&self, fail: bool) {
        self.fail_creation.store(fail, Ordering::SeqCst);
    }

    /// Worker by pool index. Panics if it does not exist.
    #[must_use]
    pub fn worker(&self, index: usize) -> Arc<MockWorker> {
        self.workers()
            .into_iter()
            .find(|w| w.settings.index == index)
            .unwrap_or_else(|| panic!("no mock worker with index {index}"))
    }

    #[must_use]
    pub fn workers(&self) -> Vec<Arc<MockWorker>> {
        self.workers.lock().unwrap().clone()
    }

    /// Every router created on any worker, oldest first.
    #[must_use]
    pub fn routers(&self) -> Vec<MockRouter> {
        self.workers().iter().flat_map(|w| w.routers()).collect()
    }

    /// Routers that are not closed.
    #[must_use]
    pub fn open_routers(&self) -> Vec<MockRouter> {
        self.routers()
            .into_iter()
            .filter(|r| !r.is_closed())
            .collect()
    }
}

#[async_trait::async_trait]
impl MediaEngine for MockEngine {
    async fn create_worker(
        &self,
        settings: WorkerSettings,
    ) -> Result<Arc<dyn EngineWorker>, EngineError> {
        if self.fail_creation.load(Ordering::SeqCst) {
            return Err(EngineError::Worker("injected worker failure".to_string()));
        }
        let worker = Arc::new(MockWorker::new(settings));
        self.workers.lock().unwrap().push(Arc::clone(&worker));
        Ok(worker)
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Mock worker with controllable CPU time and death.
pub struct MockWorker {
    settings: WorkerSettings,
    cpu_nanos: AtomicU64,
    fail_usage: AtomicBool,
    fail_router: AtomicBool,
    death_tx: watch::Sender<Option<String>>,
    routers: Mutex<Vec<MockRouter>>,
}

impl MockWorker {
    fn new(settings: WorkerSettings) -> Self {
        let (death_tx, _) = watch::channel(None);
        Self {
            settings,
            cpu_nanos: AtomicU64::new(0),
            fail_usage: AtomicBool::new(false),
            fail_router: AtomicBool::new(false),
            death_tx,
            routers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Advance the cumulative CPU time the worker reports.
    pub fn add_cpu_time(&self, delta: Duration) {
        let nanos = u64::try_from(delta.as_nanos()).unwrap();
        self.cpu_nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Make `resource_usage` fail.
    pub fn fail_usage(&self, fail: bool) {
        self.fail_usage.store(fail, Ordering::SeqCst);
    }

    /// Make `create_router` fail.
    pub fn fail_router_creation(&self, fail: bool) {
        self.fail_router.store(fail, Ordering::SeqCst);
    }

    /// Terminate the worker unexpectedly.
    pub fn kill(&self, reason: &str) {
        self.death_tx.send_replace(Some(reason.to_string()));
    }

    #[must_use]
    pub fn routers(&self) -> Vec<MockRouter> {
        self.routers.lock().unwrap().clone()
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl EngineWorker for MockWorker {
    fn id(&self) -> String {
        format!("mock-worker-{}", self.settings.index)
    }

    async fn resource_usage(&self) -> Result<WorkerUsage, EngineError> {
        if self.fail_usage.load(Ordering::SeqCst) {
            return Err(EngineError::Worker("injected usage failure".to_string()));
        }
        Ok(WorkerUsage {
            cpu_time: Duration::from_nanos(self.cpu_nanos.load(Ordering::SeqCst)),
        })
    }

    async fn create_router(
        &self,
        events: EngineEventSink,
    ) -> Result<Box<dyn MediaRouter>, EngineError> {
        if self.fail_router.load(Ordering::SeqCst) {
            return Err(EngineError::Router("injected router failure".to_string()));
        }
        let mut routers = self.routers.lock().unwrap();
        let router = MockRouter::new(
            format!("mock-router-{}-{}", self.settings.index, routers.len()),
            events,
        );
        routers.push(router.clone());
        Ok(Box::new(router))
    }

    async fn died(&self) -> String {
        let mut rx = self.death_tx.subscribe();
        let reason = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| reason.clone());
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

// ============================================================================
// Router
// ============================================================================

#[derive(Debug, Clone)]
struct TransportEntry {
    direction: TransportDirection,
    connected: bool,
}

#[derive(Debug, Clone)]
struct ProducerEntry {
    transport_id: String,
    kind: MediaKind,
    paused: bool,
}

#[derive(Debug, Clone)]
struct ConsumerEntry {
    transport_id: String,
    producer_id: String,
    paused: bool,
}

#[derive(Debug, Default)]
struct RouterState {
    closed: bool,
    observer: bool,
    observed: Vec<String>,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
    next_id: u64,
}

impl RouterState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Remove a producer and its consumers. Returns the removed consumer ids.
    fn remove_producer(&mut self, producer_id: &str) -> Vec<String> {
        self.producers.remove(producer_id);
        self.observed.retain(|id| id != producer_id);
        let mut closed: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        closed.sort();
        for id in &closed {
            self.consumers.remove(id);
        }
        closed
    }
}

#[derive(Debug, Default)]
struct Failures {
    transport: Option<TransportDirection>,
    produce: bool,
    consume: bool,
    observer: bool,
}

struct RouterInner {
    id: String,
    events: EngineEventSink,
    state: Mutex<RouterState>,
    failures: Mutex<Failures>,
    consume_calls: AtomicU64,
    close_calls: AtomicU64,
}

/// Mock router. Clones share state, so tests keep one while the room owns
/// another.
#[derive(Clone)]
pub struct MockRouter {
    inner: Arc<RouterInner>,
}

impl MockRouter {
    fn new(id: String, events: EngineEventSink) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                id,
                events,
                state: Mutex::new(RouterState::default()),
                failures: Mutex::new(Failures::default()),
                consume_calls: AtomicU64::new(0),
                close_calls: AtomicU64::new(0),
            }),
        }
    }

    fn send(&self, event: EngineEvent) {
        let _ = self.inner.events.send(event);
    }

    fn closed_error(&self) -> EngineError {
        EngineError::Router(format!("router {} is closed", self.inner.id))
    }

    // ---- failure injection ----

    /// Fail creation of transports in `direction`.
    pub fn fail_transport(&self, direction: Option<TransportDirection>) {
        self.inner.failures.lock().unwrap().transport = direction;
    }

    pub fn fail_produce(&self, fail: bool) {
        self.inner.failures.lock().unwrap().produce = fail;
    }

    pub fn fail_consume(&self, fail: bool) {
        self.inner.failures.lock().unwrap().consume = fail;
    }

    pub fn fail_observer(&self, fail: bool) {
        self.inner.failures.lock().unwrap().observer = fail;
    }

    // ---- engine-side events ----

    /// Push an arbitrary engine event to the owning room.
    pub fn emit(&self, event: EngineEvent) {
        self.send(event);
    }

    /// Report audio levels, loudest first.
    pub fn emit_volumes(&self, volumes: &[(&str, i8)]) {
        self.send(EngineEvent::AudioVolumes {
            volumes: volumes
                .iter()
                .map(|(producer_id, volume)| AudioVolume {
                    producer_id: (*producer_id).to_string(),
                    volume: *volume,
                })
                .collect(),
        });
    }

    /// Close a transport from the engine side (e.g. ICE failure).
    pub fn close_transport_remotely(&self, transport_id: &str) {
        MediaRouter::close_transport(self, transport_id);
    }

    // ---- inspection ----

    #[must_use]
    pub fn router_id(&self) -> String {
        self.inner.id.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    #[must_use]
    pub fn close_calls(&self) -> u64 {
        self.inner.close_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn consume_calls(&self) -> u64 {
        self.inner.consume_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn has_observer(&self) -> bool {
        self.inner.state.lock().unwrap().observer
    }

    #[must_use]
    pub fn observed_producers(&self) -> Vec<String> {
        self.inner.state.lock().unwrap().observed.clone()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.inner.state.lock().unwrap().transports.len()
    }

    #[must_use]
    pub fn has_transport(&self, transport_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .transports
            .contains_key(transport_id)
    }

    #[must_use]
    pub fn is_connected(&self, transport_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .transports
            .get(transport_id)
            .is_some_and(|t| t.connected)
    }

    #[must_use]
    pub fn producer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .state
            .lock()
            .unwrap()
            .producers
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn producer_paused(&self, producer_id: &str) -> Option<bool> {
        self.inner
            .state
            .lock()
            .unwrap()
            .producers
            .get(producer_id)
            .map(|p| p.paused)
    }

    #[must_use]
    pub fn consumer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .state
            .lock()
            .unwrap()
            .consumers
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Engine-side paused flag of a consumer.
    #[must_use]
    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.inner
            .state
            .lock()
            .unwrap()
            .consumers
            .get(consumer_id)
            .map(|c| c.paused)
    }

    /// Consumers of `producer_id`.
    #[must_use]
    pub fn consumers_of(&self, producer_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .state
            .lock()
            .unwrap()
            .consumers
            .iter()
            .filter(|(_, c)| c.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait::async_trait]
impl MediaRouter for MockRouter {
    fn id(&self) -> String {
        self.inner.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        full_capabilities()
    }

    fn close(&self) {
        self.inner.close_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        *state = RouterState {
            closed: true,
            ..RouterState::default()
        };
    }

    async fn create_audio_level_observer(&self) -> Result<(), EngineError> {
        if self.inner.failures.lock().unwrap().observer {
            return Err(EngineError::Observer("injected observer failure".to_string()));
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(self.closed_error());
        }
        state.observer = true;
        Ok(())
    }

    async fn observe_audio(&self, producer_id: &str) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.observer {
            return Err(EngineError::Observer("no audio level observer".to_string()));
        }
        if !state.producers.contains_key(producer_id) {
            return Err(EngineError::NotFound(format!("producer {producer_id}")));
        }
        state.observed.push(producer_id.to_string());
        Ok(())
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, EngineError> {
        if self.inner.failures.lock().unwrap().transport == Some(direction) {
            return Err(EngineError::Transport(format!(
                "injected {} transport failure",
                direction.as_str()
            )));
        }
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(self.closed_error());
        }
        let id = state.next_id(&format!("{}-transport", direction.as_str()));
        state.transports.insert(
            id.clone(),
            TransportEntry {
                direction,
                connected: false,
            },
        );
        Ok(TransportDescriptor {
            id,
            ice_parameters: json!({ "usernameFragment": "mock", "password": "mock" }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
            sctp_parameters: None,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: Value,
    ) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().unwrap();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        transport.connected = true;
        Ok(())
    }

    fn close_transport(&self, transport_id: &str) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.transports.remove(transport_id).is_none() {
                return;
            }

            let mut producers: Vec<String> = state
                .producers
                .iter()
                .filter(|(_, p)| p.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            producers.sort();
            for producer_id in producers {
                for consumer_id in state.remove_producer(&producer_id) {
                    events.push(EngineEvent::ConsumerClosed {
                        consumer_id,
                        cause: ConsumerCloseCause::ProducerClosed,
                    });
                }
                events.push(EngineEvent::ProducerClosed { producer_id });
            }

            let mut consumers: Vec<String> = state
                .consumers
                .iter()
                .filter(|(_, c)| c.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            consumers.sort();
            for consumer_id in consumers {
                state.consumers.remove(&consumer_id);
                events.push(EngineEvent::ConsumerClosed {
                    consumer_id,
                    cause: ConsumerCloseCause::TransportClosed,
                });
            }
        }
        for event in events {
            self.send(event);
        }
    }

    async fn produce(&self, request: ProduceRequest) -> Result<String, EngineError> {
        if self.inner.failures.lock().unwrap().produce {
            return Err(EngineError::Producer("injected produce failure".to_string()));
        }
        let mut state = self.inner.state.lock().unwrap();
        match state.transports.get(&request.transport_id) {
            Some(t) if t.direction == TransportDirection::Producer => {}
            Some(_) => {
                return Err(EngineError::Transport(
                    "cannot produce on a consumer transport".to_string(),
                ))
            }
            None => {
                return Err(EngineError::NotFound(format!(
                    "transport {}",
                    request.transport_id
                )))
            }
        }
        let id = state.next_id(&format!("{}-producer", request.kind.as_str()));
        state.producers.insert(
            id.clone(),
            ProducerEntry {
                transport_id: request.transport_id,
                kind: request.kind,
                paused: false,
            },
        );
        Ok(id)
    }

    fn close_producer(&self, producer_id: &str) {
        let closed = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.producers.contains_key(producer_id) {
                return;
            }
            state.remove_producer(producer_id)
        };
        for consumer_id in closed {
            self.send(EngineEvent::ConsumerClosed {
                consumer_id,
                cause: ConsumerCloseCause::ProducerClosed,
            });
        }
    }

    async fn pause_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.set_producer_paused(producer_id, true)
    }

    async fn resume_producer(&self, producer_id: &str) -> Result<(), EngineError> {
        self.set_producer_paused(producer_id, false)
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .producers
            .get(producer_id)
            .is_some_and(|p| supports(rtp_capabilities, p.kind))
    }

    async fn consume(&self, request: ConsumeRequest) -> Result<ConsumerDescriptor, EngineError> {
        self.inner.consume_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.failures.lock().unwrap().consume {
            return Err(EngineError::Consumer("injected consume failure".to_string()));
        }
        let mut state = self.inner.state.lock().unwrap();
        match state.transports.get(&request.transport_id) {
            Some(t) if t.direction == TransportDirection::Consumer => {}
            _ => {
                return Err(EngineError::NotFound(format!(
                    "consumer transport {}",
                    request.transport_id
                )))
            }
        }
        let producer = state
            .producers
            .get(&request.producer_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("producer {}", request.producer_id)))?;
        if !supports(&request.rtp_capabilities, producer.kind) {
            return Err(EngineError::Consumer(
                "capabilities cannot consume producer".to_string(),
            ));
        }

        let id = state.next_id("consumer");
        state.consumers.insert(
            id.clone(),
            ConsumerEntry {
                transport_id: request.transport_id,
                producer_id: request.producer_id.clone(),
                paused: request.paused,
            },
        );
        Ok(ConsumerDescriptor {
            id,
            producer_id: request.producer_id,
            kind: producer.kind,
            rtp_parameters: json!({ "codecs": [ { "kind": producer.kind.as_str() } ] }),
            consumer_type: "simple".to_string(),
            producer_paused: producer.paused,
        })
    }

    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.set_consumer_paused(consumer_id, true)
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.set_consumer_paused(consumer_id, false)
    }

    fn consumer_score(&self, consumer_id: &str) -> Option<Value> {
        self.inner
            .state
            .lock()
            .unwrap()
            .consumers
            .contains_key(consumer_id)
            .then(|| json!({ "score": 10, "producerScore": 10, "producerScores": [10] }))
    }
}

impl MockRouter {
    fn set_producer_paused(&self, producer_id: &str, paused: bool) -> Result<(), EngineError> {
        let consumers = {
            let mut state = self.inner.state.lock().unwrap();
            let producer = state
                .producers
                .get_mut(producer_id)
                .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;
            if producer.paused == paused {
                return Ok(());
            }
            producer.paused = paused;
            let mut ids: Vec<String> = state
                .consumers
                .iter()
                .filter(|(_, c)| c.producer_id == producer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            ids
        };
        for consumer_id in consumers {
            self.send(if paused {
                EngineEvent::ConsumerProducerPaused { consumer_id }
            } else {
                EngineEvent::ConsumerProducerResumed { consumer_id }
            });
        }
        Ok(())
    }

    fn set_consumer_paused(&self, consumer_id: &str, paused: bool) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().unwrap();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))?;
        consumer.paused = paused;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn router() -> (MockRouter, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MockRouter::new("r".to_string(), tx), rx)
    }

    async fn producer(router: &MockRouter, kind: MediaKind) -> (String, String) {
        let transport = router
            .create_transport(TransportDirection::Producer)
            .await
            .unwrap();
        let id = router
            .produce(ProduceRequest {
                transport_id: transport.id.clone(),
                kind,
                rtp_parameters: json!({}),
                app_data: Default::default(),
            })
            .await
            .unwrap();
        (transport.id, id)
    }

    async fn consumer(router: &MockRouter, producer_id: &str) -> String {
        let transport = router
            .create_transport(TransportDirection::Consumer)
            .await
            .unwrap();
        router
            .consume(ConsumeRequest {
                transport_id: transport.id,
                producer_id: producer_id.to_string(),
                rtp_capabilities: full_capabilities(),
                paused: true,
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_capability_rule() {
        assert!(supports(&full_capabilities(), MediaKind::Video));
        assert!(supports(&capabilities_for(MediaKind::Audio), MediaKind::Audio));
        assert!(!supports(&capabilities_for(MediaKind::Audio), MediaKind::Video));
        assert!(!supports(&json!({}), MediaKind::Audio));
    }

    #[tokio::test]
    async fn test_consumer_created_paused() {
        let (router, _rx) = router();
        let (_, producer_id) = producer(&router, MediaKind::Audio).await;
        let consumer_id = consumer(&router, &producer_id).await;

        assert_eq!(router.consumer_paused(&consumer_id), Some(true));
        router.resume_consumer(&consumer_id).await.unwrap();
        assert_eq!(router.consumer_paused(&consumer_id), Some(false));
    }

    #[tokio::test]
    async fn test_close_producer_cascades_to_consumers() {
        let (router, mut rx) = router();
        let (_, producer_id) = producer(&router, MediaKind::Video).await;
        let consumer_id = consumer(&router, &producer_id).await;

        router.close_producer(&producer_id);

        assert!(router.consumer_ids().is_empty());
        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::ConsumerClosed {
                consumer_id,
                cause: ConsumerCloseCause::ProducerClosed
            }
        );
    }

    #[tokio::test]
    async fn test_close_transport_reports_producer_closed() {
        let (router, mut rx) = router();
        let (transport_id, producer_id) = producer(&router, MediaKind::Audio).await;

        router.close_transport(&transport_id);

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::ProducerClosed { producer_id }
        );
    }

    #[tokio::test]
    async fn test_closed_router_rejects_calls() {
        let (router, _rx) = router();
        router.close();
        router.close();
        assert!(router.is_closed());
        assert_eq!(router.close_calls(), 2);
        assert!(router
            .create_transport(TransportDirection::Producer)
            .await
            .is_err());
    }
}
