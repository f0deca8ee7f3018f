//! `RoomRegistryActor` - owns the room id to room mapping.
//!
//! The registry is the only writer of the room map. Engine work for a new
//! room (router and audio observer creation) runs in a spawned task and
//! reports back with `RoomCreated`, so a slow creation never blocks other
//! rooms. Callers that ask for a room still being created wait on the same
//! creation; each room id is created exactly once.
//!
//! # Slots
//!
//! ```text
//! (absent) --get_or_create--> Creating --RoomCreated(ok)--> Ready
//!                                |                            |
//!                                +--RoomCreated(err)--> (absent)
//!                                                             |
//!                      (absent) <--close / RoomEmptied--------+
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::messages::{CreatedRoom, RegistryMessage, RegistryStatus};
use super::metrics::{queued, ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomContext, RoomHandle};
use crate::errors::SfuError;
use crate::observability::metrics as prom;
use crate::stores::MembershipStore;
use crate::workers::WorkerPool;

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long a removed room may take to finish its shutdown.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Return the room for `room_id`, creating it if absent.
    ///
    /// # Errors
    ///
    /// `Draining` during shutdown, `NoWorkers` or engine errors if the room
    /// could not be created.
    pub async fn get_or_create(&self, room_id: &str) -> Result<RoomHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreate {
                room_id: room_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Return an existing room.
    ///
    /// # Errors
    ///
    /// `RoomNotFound` if no ready room exists for `room_id`.
    pub async fn get(&self, room_id: &str) -> Result<RoomHandle, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Get {
                room_id: room_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Close and remove a room. Closing an absent room succeeds.
    pub async fn close(&self, room_id: &str) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Close {
                room_id: room_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting rooms and close every live room.
    ///
    /// Resolves once all rooms stopped or `deadline` passed.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the registry and, through child tokens, every room.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct ManagedRoom {
    handle: RoomHandle,
    task_handle: JoinHandle<()>,
    worker_index: usize,
    created_at: Instant,
}

enum RoomSlot {
    Creating {
        creation_id: Uuid,
        waiters: Vec<oneshot::Sender<Result<RoomHandle, SfuError>>>,
    },
    Ready(ManagedRoom),
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Clone of the mailbox sender, for creation tasks and rooms.
    self_sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    rooms: HashMap<String, RoomSlot>,
    pool: Arc<WorkerPool>,
    membership: Arc<dyn MembershipStore>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
    is_draining: bool,
}

impl RoomRegistryActor {
    /// Spawn the registry actor.
    pub fn spawn(
        instance_id: String,
        pool: Arc<WorkerPool>,
        membership: Arc<dyn MembershipStore>,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> (RoomRegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = Self {
            instance_id: instance_id.clone(),
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            pool,
            membership,
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, &instance_id),
            is_draining: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomRegistryHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.registry",
            instance_id = %self.instance_id,
            workers = self.pool.len(),
            "RoomRegistryActor started"
        );

        loop {
            // Check for rooms that exited on their own
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.registry",
                        instance_id = %self.instance_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_received(queued(&self.self_sender));
                            self.handle_message(message).await;
                            self.mailbox.record_processed();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.registry",
                                instance_id = %self.instance_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.registry",
            instance_id = %self.instance_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RegistryMessage) {
        let name = message.name();
        let start = Instant::now();

        match message {
            RegistryMessage::GetOrCreate {
                room_id,
                respond_to,
            } => {
                self.handle_get_or_create(room_id, respond_to);
            }

            RegistryMessage::Get {
                room_id,
                respond_to,
            } => {
                let result = match self.rooms.get(&room_id) {
                    Some(RoomSlot::Ready(managed)) => Ok(managed.handle.clone()),
                    _ => Err(SfuError::RoomNotFound(room_id)),
                };
                let _ = respond_to.send(result);
            }

            RegistryMessage::Close {
                room_id,
                respond_to,
            } => {
                self.handle_close(&room_id);
                let _ = respond_to.send(());
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.handle_shutdown(deadline).await;
                let _ = respond_to.send(());
            }

            RegistryMessage::RoomCreated {
                room_id,
                creation_id,
                result,
            } => {
                self.handle_room_created(room_id, creation_id, result);
            }

            RegistryMessage::RoomEmptied {
                room_id,
                incarnation,
            } => {
                self.handle_room_emptied(&room_id, incarnation);
            }
        }

        prom::record_message_latency(name, start.elapsed());
    }

    fn handle_get_or_create(
        &mut self,
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomHandle, SfuError>>,
    ) {
        if self.is_draining {
            let _ = respond_to.send(Err(SfuError::Draining));
            return;
        }

        match self.rooms.get_mut(&room_id) {
            Some(RoomSlot::Ready(managed)) => {
                let _ = respond_to.send(Ok(managed.handle.clone()));
            }
            Some(RoomSlot::Creating { waiters, .. }) => {
                waiters.push(respond_to);
            }
            None => {
                let creation_id = Uuid::new_v4();
                self.rooms.insert(
                    room_id.clone(),
                    RoomSlot::Creating {
                        creation_id,
                        waiters: vec![respond_to],
                    },
                );
                self.spawn_creation(room_id, creation_id);
            }
        }
    }

    /// Create engine resources off the registry loop.
    fn spawn_creation(&self, room_id: String, creation_id: Uuid) {
        let pool = Arc::clone(&self.pool);
        let sender = self.self_sender.clone();

        debug!(
            target: "sfu.registry",
            room_id = %room_id,
            "Creating room"
        );

        tokio::spawn(async move {
            let start = Instant::now();
            let result = create_room_media(&pool).await;
            if result.is_ok() {
                prom::record_room_creation(start.elapsed());
            }

            let message = RegistryMessage::RoomCreated {
                room_id,
                creation_id,
                result,
            };
            if let Err(SendError(RegistryMessage::RoomCreated {
                result: Ok(created),
                ..
            })) = sender.send(message).await
            {
                // Registry is gone; do not leak the router
                created.router.close();
            }
        });
    }

    fn handle_room_created(
        &mut self,
        room_id: String,
        creation_id: Uuid,
        result: Result<CreatedRoom, SfuError>,
    ) {
        let current = matches!(
            self.rooms.get(&room_id),
            Some(RoomSlot::Creating { creation_id: id, .. }) if *id == creation_id
        );
        if !current {
            // Closed or shut down while creating
            if let Ok(created) = result {
                debug!(
                    target: "sfu.registry",
                    room_id = %room_id,
                    "Discarding room created after close"
                );
                created.router.close();
            }
            return;
        }

        let Some(RoomSlot::Creating { waiters, .. }) = self.rooms.remove(&room_id) else {
            return;
        };

        match result {
            Ok(created) => {
                let worker_index = created.worker_index;
                let context = RoomContext {
                    registry: self.self_sender.clone(),
                    membership: Arc::clone(&self.membership),
                    metrics: Arc::clone(&self.metrics),
                };
                let (handle, task_handle) = RoomActor::spawn(
                    room_id.clone(),
                    created,
                    context,
                    self.cancel_token.child_token(),
                );

                for waiter in waiters {
                    let _ = waiter.send(Ok(handle.clone()));
                }

                info!(
                    target: "sfu.registry",
                    room_id = %room_id,
                    incarnation = %handle.incarnation(),
                    worker = worker_index,
                    total_rooms = self.ready_count() + 1,
                    "Room created"
                );

                self.rooms.insert(
                    room_id,
                    RoomSlot::Ready(ManagedRoom {
                        handle,
                        task_handle,
                        worker_index,
                        created_at: Instant::now(),
                    }),
                );
                self.metrics.room_created();
            }
            Err(e) => {
                warn!(
                    target: "sfu.registry",
                    room_id = %room_id,
                    error = %e,
                    "Room creation failed"
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    fn handle_close(&mut self, room_id: &str) {
        match self.rooms.remove(room_id) {
            Some(RoomSlot::Ready(managed)) => {
                info!(
                    target: "sfu.registry",
                    room_id = %room_id,
                    "Closing room"
                );
                self.retire_room(room_id, managed);
            }
            Some(RoomSlot::Creating { waiters, .. }) => {
                // The late RoomCreated closes the router
                for waiter in waiters {
                    let _ = waiter.send(Err(SfuError::RoomClosed));
                }
            }
            None => {
                debug!(
                    target: "sfu.registry",
                    room_id = %room_id,
                    "Close for unknown room ignored"
                );
            }
        }
    }

    fn handle_room_emptied(&mut self, room_id: &str, incarnation: Uuid) {
        let matches = matches!(
            self.rooms.get(room_id),
            Some(RoomSlot::Ready(managed)) if managed.handle.incarnation() == incarnation
        );
        if !matches {
            return;
        }

        if let Some(RoomSlot::Ready(managed)) = self.rooms.remove(room_id) {
            info!(
                target: "sfu.registry",
                room_id = %room_id,
                lifetime_secs = managed.created_at.elapsed().as_secs(),
                "Room emptied, removed"
            );
            self.retire_room(room_id, managed);
        }
    }

    /// Cancel a removed room and reap its task in the background.
    fn retire_room(&self, room_id: &str, managed: ManagedRoom) {
        managed.handle.cancel();
        self.metrics.room_removed();

        let room_id = room_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.registry",
                        room_id = %room_id,
                        "Room task completed"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room task panicked during close"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.registry",
                        room_id = %room_id,
                        "Room task close timed out"
                    );
                }
            }
        });
    }

    #[instrument(skip_all, fields(instance_id = %self.instance_id))]
    async fn handle_shutdown(&mut self, deadline: Duration) {
        self.is_draining = true;

        let rooms: Vec<(String, RoomSlot)> = self.rooms.drain().collect();
        info!(
            target: "sfu.registry",
            instance_id = %self.instance_id,
            rooms = rooms.len(),
            deadline_secs = deadline.as_secs(),
            "Draining rooms"
        );

        let mut tasks = Vec::new();
        for (room_id, slot) in rooms {
            match slot {
                RoomSlot::Ready(managed) => {
                    managed.handle.cancel();
                    self.metrics.room_removed();
                    tasks.push((room_id, managed.task_handle));
                }
                RoomSlot::Creating { waiters, .. } => {
                    for waiter in waiters {
                        let _ = waiter.send(Err(SfuError::Draining));
                    }
                }
            }
        }

        let drain = async {
            for (room_id, task) in tasks {
                if let Err(e) = task.await {
                    warn!(
                        target: "sfu.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room task failed during drain"
                    );
                }
            }
        };

        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!(
                target: "sfu.registry",
                instance_id = %self.instance_id,
                "Drain deadline passed with rooms still closing"
            );
        }
    }

    /// Reap rooms whose task ended without going through the registry.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter_map(|(room_id, slot)| match slot {
                RoomSlot::Ready(managed) if managed.task_handle.is_finished() => {
                    Some(room_id.clone())
                }
                _ => None,
            })
            .collect();

        for room_id in finished {
            let Some(RoomSlot::Ready(managed)) = self.rooms.remove(&room_id) else {
                continue;
            };
            self.metrics.room_removed();

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "sfu.registry",
                        room_id = %room_id,
                        worker = managed.worker_index,
                        "Room actor exited cleanly"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.registry",
                            room_id = %room_id,
                            error = ?join_error,
                            "Room actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Room);
                    }
                }
            }
        }
    }

    /// Perform graceful shutdown on cancellation.
    async fn graceful_shutdown(&mut self) {
        if !self.is_draining {
            self.handle_shutdown(Duration::from_secs(30)).await;
        }

        info!(
            target: "sfu.registry",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    fn ready_count(&self) -> usize {
        self.rooms
            .values()
            .filter(|slot| matches!(slot, RoomSlot::Ready(_)))
            .count()
    }

    fn status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.ready_count(),
            creating_count: self.rooms.len().saturating_sub(self.ready_count()),
            participant_count: self.metrics.participant_count(),
            is_draining: self.is_draining,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }
}

/// Pick the least loaded worker and create a router plus audio observer on it.
async fn create_room_media(pool: &WorkerPool) -> Result<CreatedRoom, SfuError> {
    let worker = pool.select_least_loaded()?;
    let (events_tx, events) = mpsc::unbounded_channel();
    let router = worker.worker().create_router(events_tx).await?;

    if let Err(e) = router.create_audio_level_observer().await {
        warn!(
            target: "sfu.registry",
            worker = worker.index(),
            error = %e,
            "Failed to create audio level observer, active speaker disabled"
        );
    }

    Ok(CreatedRoom {
        router,
        events,
        worker_index: worker.index(),
    })
}
