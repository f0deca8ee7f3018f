//! End-to-end room harness.
//!
//! Wires the mock engine, a worker pool, the mock stores, the registry
//! and the gateway the way the binary wires the real ones. Clients are
//! [`MockChannel`]s driven through [`TestClient`].
//!
//! ```rust,ignore
//! let harness = RoomHarness::start(1).await;
//! let alice = harness.join("room-1", "alice", fixtures::speaker()).await;
//! alice.config().await;
//! let producer_id = alice.produce(MediaKind::Audio).await.unwrap();
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sfu_controller::actors::{
    ActorMetrics, DisconnectReason, RoomHandle, RoomRegistryActor, RoomRegistryHandle, RoomState,
};
use sfu_controller::engine::{MediaEngine, MediaKind, MediaRouter};
use sfu_controller::errors::SfuError;
use sfu_controller::permissions::Grants;
use sfu_controller::signaling::gateway::{AdmissionTicket, JoinedSession};
use sfu_controller::signaling::{ClientEvent, Responder, SignalingChannel, SignalingGateway};
use sfu_controller::stores::{IdentityStore, MembershipStore};
use sfu_controller::workers::WorkerPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::fixtures;
use crate::mock_channel::MockChannel;
use crate::mock_engine::{MockEngine, MockRouter};
use crate::mock_stores::{MockIdentityStore, MockMembershipStore};

/// How long helpers wait for a reply or a condition.
pub const WAIT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds or [`WAIT`] passes.
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Async variant of [`wait_until`].
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Full orchestration stack over mocks.
pub struct RoomHarness {
    pub engine: Arc<MockEngine>,
    pub pool: Arc<WorkerPool>,
    pub identity: MockIdentityStore,
    pub membership: MockMembershipStore,
    pub metrics: Arc<ActorMetrics>,
    pub registry: RoomRegistryHandle,
    pub gateway: Arc<SignalingGateway>,
    pub cancel: CancellationToken,
    registry_task: JoinHandle<()>,
}

impl RoomHarness {
    /// Start a stack with `workers` mock workers.
    pub async fn start(workers: usize) -> Self {
        Self::start_with(workers, MockIdentityStore::new(), true, true).await
    }

    pub async fn start_with(
        workers: usize,
        identity: MockIdentityStore,
        allow_produce: bool,
        allow_consume: bool,
    ) -> Self {
        let engine = MockEngine::new();
        let cancel = CancellationToken::new();
        let pool = WorkerPool::create(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            fixtures::pool_settings(workers),
            cancel.child_token(),
        )
        .await
        .expect("mock pool starts");

        let membership = MockMembershipStore::new();
        let metrics = ActorMetrics::new();
        let (registry, registry_task) = RoomRegistryActor::spawn(
            "sfu-test".to_string(),
            Arc::clone(&pool),
            Arc::new(membership.clone()) as Arc<dyn MembershipStore>,
            Arc::clone(&metrics),
            cancel.child_token(),
        );
        let gateway = Arc::new(SignalingGateway::new(
            registry.clone(),
            Arc::new(identity.clone()) as Arc<dyn IdentityStore>,
            allow_produce,
            allow_consume,
        ));

        Self {
            engine,
            pool,
            identity,
            membership,
            metrics,
            registry,
            gateway,
            cancel,
            registry_task,
        }
    }

    /// Join `participant_id` with explicit grants, skipping token lookup.
    pub async fn join(&self, room_id: &str, participant_id: &str, grants: Grants) -> TestClient {
        self.try_join(room_id, participant_id, grants)
            .await
            .expect("join succeeds")
            .expect("participant not already present")
    }

    pub async fn try_join(
        &self,
        room_id: &str,
        participant_id: &str,
        grants: Grants,
    ) -> Result<Option<TestClient>, SfuError> {
        let ticket = AdmissionTicket {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
            options: fixtures::join_options(grants),
        };
        let channel = MockChannel::new(format!("conn-{participant_id}-{}", Uuid::new_v4()));
        let joined = self
            .gateway
            .join(&ticket, Arc::clone(&channel) as Arc<dyn SignalingChannel>)
            .await?;
        Ok(joined.map(|session| TestClient::new(session, channel)))
    }

    /// Join through token authentication, as a socket would.
    pub async fn admit(&self, room_id: &str, token: &str) -> Result<Option<TestClient>, SfuError> {
        let channel = MockChannel::new(format!("conn-{}", Uuid::new_v4()));
        let joined = self
            .gateway
            .admit(
                room_id,
                token,
                Arc::clone(&channel) as Arc<dyn SignalingChannel>,
            )
            .await?;
        Ok(joined.map(|session| TestClient::new(session, channel)))
    }

    pub async fn state(&self, room_id: &str) -> RoomState {
        self.registry
            .get(room_id)
            .await
            .expect("room exists")
            .get_state()
            .await
            .expect("room answers")
    }

    /// The only open router. Panics unless exactly one exists.
    #[must_use]
    pub fn router(&self) -> MockRouter {
        let mut open = self.engine.open_routers();
        assert_eq!(open.len(), 1, "expected exactly one open router");
        open.remove(0)
    }

    /// The open router of `room_id`.
    pub async fn router_of(&self, room_id: &str) -> MockRouter {
        let router_id = self.state(room_id).await.router_id;
        self.engine
            .routers()
            .into_iter()
            .find(|r| r.id() == router_id)
            .expect("router exists")
    }

    /// Wait until the registry no longer lists `room_id`.
    pub async fn wait_room_gone(&self, room_id: &str) -> bool {
        eventually(|| async move {
            matches!(
                self.registry.get(room_id).await,
                Err(SfuError::RoomNotFound(_))
            )
        })
        .await
    }

    pub async fn stop(self) {
        let _ = self.registry.shutdown(WAIT).await;
        self.cancel.cancel();
        let _ = tokio::time::timeout(WAIT, self.registry_task).await;
    }
}

/// A participant session driven by the test.
pub struct TestClient {
    pub participant_id: String,
    pub session_id: Uuid,
    pub room: RoomHandle,
    pub channel: Arc<MockChannel>,
}

impl std::fmt::Debug for TestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestClient")
            .field("participant_id", &self.participant_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl TestClient {
    fn new(session: JoinedSession, channel: Arc<MockChannel>) -> Self {
        Self {
            participant_id: session.participant_id,
            session_id: session.session_id,
            room: session.room,
            channel,
        }
    }

    /// Send an event and wait for its reply. `None` if the room sent none.
    pub async fn send(&self, event: ClientEvent) -> Option<Value> {
        let (responder, reply) = Responder::new();
        self.room
            .client_event(
                self.participant_id.clone(),
                self.session_id,
                event,
                Some(responder),
            )
            .await
            .ok()?;
        tokio::time::timeout(WAIT, reply).await.ok()?.ok()
    }

    /// Send an event without asking for a reply.
    pub async fn notify(&self, event: ClientEvent) {
        let _ = self
            .room
            .client_event(self.participant_id.clone(), self.session_id, event, None)
            .await;
    }

    /// Confirm the join with capabilities for both kinds.
    pub async fn config(&self) -> Option<Value> {
        self.config_with(Some(fixtures::full_capabilities())).await
    }

    pub async fn config_with(&self, receive_capabilities: Option<Value>) -> Option<Value> {
        self.send(fixtures::config_event(receive_capabilities)).await
    }

    /// Configure and wait until the room marks the session synced.
    pub async fn config_and_sync(&self) {
        assert!(self.config().await.is_some(), "config rejected");
        let synced = eventually(|| async move {
            self.room
                .get_state()
                .await
                .ok()
                .and_then(|s| s.participant(&self.participant_id).map(|p| p.synced))
                .unwrap_or(false)
        })
        .await;
        assert!(synced, "{} never synced", self.participant_id);
    }

    #[must_use]
    pub fn producer_transport_id(&self) -> Option<String> {
        self.channel.config().producer_transport.map(|t| t.id)
    }

    #[must_use]
    pub fn consumer_transport_id(&self) -> Option<String> {
        self.channel.config().consumer_transport.map(|t| t.id)
    }

    /// Produce `kind` on the producer transport. `None` when not permitted.
    pub async fn produce(&self, kind: MediaKind) -> Option<String> {
        let transport_id = self.producer_transport_id()?;
        self.produce_on(&transport_id, kind).await
    }

    pub async fn produce_on(&self, transport_id: &str, kind: MediaKind) -> Option<String> {
        self.send(fixtures::produce_event(transport_id, kind))
            .await
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub async fn pause_consumers(&self, ids: &[&str]) -> Option<Value> {
        self.send(ClientEvent::ConsumersPaused(
            ids.iter().map(|s| (*s).to_string()).collect(),
        ))
        .await
    }

    pub async fn resume_consumers(&self, ids: &[&str]) -> Option<Value> {
        self.send(ClientEvent::ConsumersResumed(
            ids.iter().map(|s| (*s).to_string()).collect(),
        ))
        .await
    }

    pub async fn close_producer(&self, producer_id: &str) -> Option<Value> {
        self.send(ClientEvent::ProducerClosed(fixtures::producer_ref(producer_id)))
            .await
    }

    pub async fn pause_producer(&self, producer_id: &str) -> Option<Value> {
        self.send(ClientEvent::ProducerPaused(fixtures::producer_ref(producer_id)))
            .await
    }

    pub async fn resume_producer(&self, producer_id: &str) -> Option<Value> {
        self.send(ClientEvent::ProducerResumed(fixtures::producer_ref(producer_id)))
            .await
    }

    /// Close the connection, as the socket task does on client close.
    pub async fn leave(&self) {
        self.channel.disconnect();
        let _ = self
            .room
            .disconnect(
                self.participant_id.clone(),
                self.session_id,
                DisconnectReason::ClientClosed,
            )
            .await;
    }
}
