//! `RoomActor` - per-room actor that owns one routing context and its
//! participants.
//!
//! Each `RoomActor`:
//! - Owns its router, the participant sessions and every transport,
//!   producer and consumer created on the router
//! - Processes client events, engine notifications and acknowledgements
//!   one at a time from a single mailbox, so room state needs no locks
//! - Runs every handler through the isolation wrapper
//! - Closes itself when its last participant leaves
//!
//! # Self-close
//!
//! When the participant count reaches zero the room tells the registry
//! (`RoomEmptied`) before closing the router and exiting. Joins already
//! queued in the mailbox are answered with `RoomClosed`, and the gateway
//! retries them against a fresh room.
//!
//! # Membership writes
//!
//! Membership updates go through one ordered writer task per room so an
//! add and a remove for the same participant cannot be reordered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::fanout::{self, PendingConsumerAck, ProducerInfo};
use super::messages::{
    ok_reply, AddOutcome, CreatedRoom, DisconnectReason, JoinOptions, RegistryMessage,
    RoomMessage, RoomState,
};
use super::metrics::{queued, ActorMetrics, ActorType, MailboxMonitor};
use super::session::{ParticipantSession, ProducerRecord};
use crate::engine::{
    EngineEvent, EngineEventStream, MediaKind, MediaRouter, ProduceRequest, TransportDescriptor,
    TransportDirection,
};
use crate::errors::SfuError;
use crate::isolation::{isolate, HandlerContext};
use crate::observability::metrics as prom;
use crate::permissions::{can_produce, may_open_producer_transport};
use crate::signaling::protocol::{
    ActiveSpeaker, ClientConfig, ClientEvent, ConnectTransport, ConsumerRef, LayersChanged,
    ParticipantRef, ProduceParams, ScoreReport, ServerConfig,
};
use crate::signaling::{Responder, ServerEvent, SignalingChannel};
use crate::stores::MembershipStore;

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Upper bound for flushing membership writes when the room exits.
const MEMBERSHIP_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    incarnation: Uuid,
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for RoomHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomHandle")
            .field("room_id", &self.room_id)
            .field("incarnation", &self.incarnation)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl RoomHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Distinguishes this room from earlier rooms with the same id.
    #[must_use]
    pub fn incarnation(&self) -> Uuid {
        self.incarnation
    }

    /// Add a participant to the room.
    ///
    /// # Errors
    ///
    /// `RoomClosed` if the room exited or is closing; engine errors if its
    /// transports could not be created.
    pub async fn add_participant(
        &self,
        participant_id: String,
        channel: Arc<dyn SignalingChannel>,
        options: JoinOptions,
    ) -> Result<AddOutcome, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::AddParticipant {
                participant_id,
                channel,
                options,
                respond_to: tx,
            })
            .await
            .map_err(|_| SfuError::RoomClosed)?;

        rx.await.map_err(|_| SfuError::RoomClosed)?
    }

    /// Forward a client event. The outcome reaches the client via `responder`.
    pub async fn client_event(
        &self,
        participant_id: String,
        session_id: Uuid,
        event: ClientEvent,
        responder: Option<Responder>,
    ) -> Result<(), SfuError> {
        self.sender
            .send(RoomMessage::ClientEvent {
                participant_id,
                session_id,
                event,
                responder,
            })
            .await
            .map_err(|_| SfuError::RoomClosed)
    }

    /// Report that a participant's connection closed.
    pub async fn disconnect(
        &self,
        participant_id: String,
        session_id: Uuid,
        reason: DisconnectReason,
    ) -> Result<(), SfuError> {
        self.sender
            .send(RoomMessage::Disconnect {
                participant_id,
                session_id,
                reason,
            })
            .await
            .map_err(|_| SfuError::RoomClosed)
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| SfuError::RoomClosed)?;

        rx.await.map_err(|_| SfuError::RoomClosed)
    }

    /// Cancel the room, closing every session and the router.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled() || self.sender.is_closed()
    }
}

/// Collaborators a room needs from the registry.
#[derive(Clone)]
pub struct RoomContext {
    pub registry: mpsc::Sender<RegistryMessage>,
    pub membership: Arc<dyn MembershipStore>,
    pub metrics: Arc<ActorMetrics>,
}

enum MembershipOp {
    Add(String),
    Remove(String),
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    incarnation: Uuid,
    worker_index: usize,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Clone of the mailbox sender, for acknowledgement watchers.
    self_sender: mpsc::Sender<RoomMessage>,
    events: EngineEventStream,
    router: Box<dyn MediaRouter>,
    participants: HashMap<String, ParticipantSession>,
    active_speaker: Option<String>,
    /// Set once the room decided to close itself.
    closed: bool,
    cancel_token: CancellationToken,
    registry: mpsc::Sender<RegistryMessage>,
    membership_tx: Option<mpsc::UnboundedSender<MembershipOp>>,
    membership_task: Option<JoinHandle<()>>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor over freshly created engine resources.
    pub fn spawn(
        room_id: String,
        created: CreatedRoom,
        context: RoomContext,
        cancel_token: CancellationToken,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let incarnation = Uuid::new_v4();
        let (membership_tx, membership_task) =
            spawn_membership_writer(room_id.clone(), context.membership);

        let actor = Self {
            room_id: room_id.clone(),
            incarnation,
            worker_index: created.worker_index,
            receiver,
            self_sender: sender.clone(),
            events: created.events,
            router: created.router,
            participants: HashMap::new(),
            active_speaker: None,
            closed: false,
            cancel_token: cancel_token.clone(),
            registry: context.registry,
            membership_tx: Some(membership_tx),
            membership_task: Some(membership_task),
            metrics: context.metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomHandle {
            room_id,
            incarnation,
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            incarnation = %self.incarnation,
            worker = self.worker_index,
            router_id = %self.router.id(),
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
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
                                target: "sfu.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }

                Some(event) = self.events.recv() => {
                    self.handle_engine_event(event).await;
                }
            }

            if self.closed {
                break;
            }
        }

        self.reject_queued();
        self.flush_membership().await;

        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox = self.mailbox.peak_depth(),
            "RoomActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RoomMessage) {
        let name = message.name();
        let start = Instant::now();

        match message {
            RoomMessage::AddParticipant {
                participant_id,
                channel,
                options,
                respond_to,
            } => {
                let result = self.handle_add(participant_id, channel, options).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ClientEvent {
                participant_id,
                session_id,
                event,
                responder,
            } => {
                let ctx = self.context(event.name()).participant(participant_id.clone());
                let outcome = isolate(
                    ctx,
                    self.dispatch_client_event(&participant_id, session_id, event),
                )
                .await;
                // Failed handlers send no reply
                if let (Some(responder), Some(reply)) = (responder, outcome) {
                    responder.reply(reply.unwrap_or_else(ok_reply));
                }
            }

            RoomMessage::Disconnect {
                participant_id,
                session_id,
                reason,
            } => {
                self.handle_disconnect(&participant_id, session_id, reason)
                    .await;
            }

            RoomMessage::JoinAcknowledged {
                participant_id,
                session_id,
            } => {
                let ctx = self.context("joined").participant(participant_id.clone());
                isolate(ctx, self.handle_join_ack(&participant_id, session_id)).await;
            }

            RoomMessage::ConsumerAcknowledged {
                participant_id,
                session_id,
                consumer_id,
                accepted,
            } => {
                let ctx = self
                    .context("make-consumer")
                    .participant(participant_id.clone());
                isolate(
                    ctx,
                    self.handle_consumer_ack(&participant_id, session_id, &consumer_id, accepted),
                )
                .await;
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
        }

        prom::record_message_latency(name, start.elapsed());
    }

    fn context(&self, event: &'static str) -> HandlerContext {
        HandlerContext::new(self.room_id.clone(), event, Arc::clone(&self.metrics))
    }

    fn session(&self, participant_id: &str) -> Result<&ParticipantSession, SfuError> {
        self.participants
            .get(participant_id)
            .ok_or_else(|| SfuError::ParticipantNotFound(participant_id.to_string()))
    }

    fn session_mut(&mut self, participant_id: &str) -> Result<&mut ParticipantSession, SfuError> {
        self.participants
            .get_mut(participant_id)
            .ok_or_else(|| SfuError::ParticipantNotFound(participant_id.to_string()))
    }

    // ========================================================================
    // Join
    // ========================================================================

    #[instrument(skip_all, fields(room_id = %self.room_id, participant_id = %participant_id))]
    async fn handle_add(
        &mut self,
        participant_id: String,
        channel: Arc<dyn SignalingChannel>,
        options: JoinOptions,
    ) -> Result<AddOutcome, SfuError> {
        if self.closed {
            return Err(SfuError::RoomClosed);
        }

        if self.participants.contains_key(&participant_id) {
            info!(
                target: "sfu.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Participant already present, ignoring duplicate join"
            );
            return Ok(AddOutcome::AlreadyPresent);
        }

        let (producer_transport, consumer_transport) = match self.open_transports(&options).await
        {
            Ok(transports) => transports,
            Err(e) => {
                warn!(
                    target: "sfu.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    error = %e,
                    "Failed to create participant transports"
                );
                if self.participants.is_empty() {
                    self.self_close("first join failed").await;
                }
                return Err(e);
            }
        };

        let transports = producer_transport
            .iter()
            .map(|t| (t.id.clone(), TransportDirection::Producer))
            .chain(
                consumer_transport
                    .iter()
                    .map(|t| (t.id.clone(), TransportDirection::Consumer)),
            )
            .collect::<Vec<_>>();

        let session = ParticipantSession::new(
            participant_id.clone(),
            channel,
            options.grants,
            transports,
        );
        let session_id = session.session_id();

        session.emit(ServerEvent::Config(ServerConfig {
            router_capabilities: self.router.rtp_capabilities(),
            producer_transport,
            consumer_transport,
        }));

        self.participants.insert(participant_id.clone(), session);
        self.metrics.participant_added();

        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            session_id = %session_id,
            participants = self.participants.len(),
            "Participant added"
        );

        Ok(AddOutcome::Added { session_id })
    }

    async fn open_transports(
        &self,
        options: &JoinOptions,
    ) -> Result<(Option<TransportDescriptor>, Option<TransportDescriptor>), SfuError> {
        let producer = if may_open_producer_transport(options.allow_produce, &options.grants) {
            Some(
                self.router
                    .create_transport(TransportDirection::Producer)
                    .await?,
            )
        } else {
            None
        };

        let consumer = if options.allow_consume {
            match self
                .router
                .create_transport(TransportDirection::Consumer)
                .await
            {
                Ok(transport) => Some(transport),
                Err(e) => {
                    if let Some(p) = &producer {
                        self.router.close_transport(&p.id);
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        Ok((producer, consumer))
    }

    // ========================================================================
    // Client events
    // ========================================================================

    async fn dispatch_client_event(
        &mut self,
        participant_id: &str,
        session_id: Uuid,
        event: ClientEvent,
    ) -> Result<Option<Value>, SfuError> {
        self.session(participant_id)?.check_session(session_id)?;

        match event {
            ClientEvent::Config(config) => {
                self.on_config(participant_id, config)?;
                Ok(None)
            }
            ClientEvent::ConnectTransport(params) => {
                self.on_connect_transport(participant_id, params).await?;
                Ok(None)
            }
            ClientEvent::Produce(params) => self.on_produce(participant_id, params).await.map(Some),
            ClientEvent::ConsumersPaused(ids) => {
                self.on_consumers_paused(participant_id, &ids, true).await?;
                Ok(None)
            }
            ClientEvent::ConsumersResumed(ids) => {
                self.on_consumers_paused(participant_id, &ids, false)
                    .await?;
                Ok(None)
            }
            ClientEvent::ProducerClosed(producer) => {
                self.on_producer_closed(participant_id, &producer.producer_id)?;
                Ok(None)
            }
            ClientEvent::ProducerPaused(producer) => {
                self.on_producer_paused(participant_id, &producer.producer_id, true)
                    .await?;
                Ok(None)
            }
            ClientEvent::ProducerResumed(producer) => {
                self.on_producer_paused(participant_id, &producer.producer_id, false)
                    .await?;
                Ok(None)
            }
        }
    }

    /// `config`: the participant becomes visible and gets its roster.
    ///
    /// Consumers for existing producers are created once the roster is
    /// acknowledged (see `handle_join_ack`).
    fn on_config(&mut self, participant_id: &str, config: ClientConfig) -> Result<(), SfuError> {
        let mut roster: Vec<String> = self
            .participants
            .values()
            .filter(|p| p.participant_id() != participant_id && p.is_joined())
            .map(|p| p.participant_id().to_string())
            .collect();
        roster.sort();

        let session = self.session_mut(participant_id)?;
        session.confirm_join(config)?;
        let session_id = session.session_id();
        let roster_ack = session.channel().request(ServerEvent::Joined(roster.clone()));

        self.persist_membership(MembershipOp::Add(participant_id.to_string()));
        self.broadcast(
            Some(participant_id),
            &ServerEvent::ParticipantJoined(ParticipantRef {
                participant_id: participant_id.to_string(),
            }),
        );

        let sender = self.self_sender.clone();
        let participant = participant_id.to_string();
        tokio::spawn(async move {
            if roster_ack.await.is_ok() {
                let _ = sender
                    .send(RoomMessage::JoinAcknowledged {
                        participant_id: participant,
                        session_id,
                    })
                    .await;
            }
        });

        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            roster = roster.len(),
            "Participant joined"
        );
        Ok(())
    }

    async fn on_connect_transport(
        &mut self,
        participant_id: &str,
        params: ConnectTransport,
    ) -> Result<(), SfuError> {
        let direction = self
            .session(participant_id)?
            .require_transport(&params.transport_id)?;

        self.router
            .connect_transport(&params.transport_id, params.dtls_parameters)
            .await?;

        debug!(
            target: "sfu.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            transport_id = %params.transport_id,
            direction = direction.as_str(),
            "Transport connected"
        );
        Ok(())
    }

    /// `produce`: replies with the producer id, or `null` when the grants
    /// do not allow this kind.
    #[instrument(skip_all, fields(room_id = %self.room_id, participant_id = %participant_id, kind = %params.kind))]
    async fn on_produce(
        &mut self,
        participant_id: &str,
        params: ProduceParams,
    ) -> Result<Value, SfuError> {
        let session = self.session(participant_id)?;
        session.require_joined()?;

        // Grants first: a listener has no producer transport to name
        if !can_produce(session.grants(), params.kind) {
            debug!(
                target: "sfu.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                kind = %params.kind,
                "Produce not permitted"
            );
            return Ok(Value::Null);
        }

        if session.require_transport(&params.transport_id)? != TransportDirection::Producer {
            return Err(SfuError::UnknownTransport(params.transport_id));
        }

        let producer_id = self
            .router
            .produce(ProduceRequest {
                transport_id: params.transport_id.clone(),
                kind: params.kind,
                rtp_parameters: params.rtp_parameters,
                app_data: params.app_data.clone(),
            })
            .await?;

        self.session_mut(participant_id)?.add_producer(
            producer_id.clone(),
            ProducerRecord {
                kind: params.kind,
                transport_id: params.transport_id,
                app_data: params.app_data.clone(),
                paused: false,
            },
        );

        if params.kind == MediaKind::Audio {
            if let Err(e) = self.router.observe_audio(&producer_id).await {
                warn!(
                    target: "sfu.room",
                    room_id = %self.room_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Failed to observe audio producer"
                );
            }
        }

        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            kind = %params.kind,
            "Producer created"
        );

        let producer = ProducerInfo {
            producer_id: producer_id.clone(),
            owner_id: participant_id.to_string(),
            kind: params.kind,
            app_data: params.app_data,
        };
        for consuming_id in fanout::consumers_for_producer(&self.participants, participant_id) {
            self.fan_out(&consuming_id, &producer).await;
        }

        Ok(Value::String(producer_id))
    }

    /// `consumers-paused` / `consumers-resumed`.
    ///
    /// Every id must belong to the requester before anything changes. A
    /// consumer not yet acknowledged only records the flag; the engine
    /// keeps it paused until the acknowledgement.
    async fn on_consumers_paused(
        &mut self,
        participant_id: &str,
        consumer_ids: &[String],
        pause: bool,
    ) -> Result<(), SfuError> {
        let session = self.session(participant_id)?;
        if let Some(unknown) = consumer_ids.iter().find(|id| !session.owns_consumer(id)) {
            return Err(SfuError::UnknownConsumer(unknown.clone()));
        }

        for consumer_id in consumer_ids {
            let acknowledged = {
                let consumer = self
                    .session_mut(participant_id)?
                    .consumer_mut(consumer_id)
                    .ok_or_else(|| SfuError::UnknownConsumer(consumer_id.clone()))?;
                consumer.client_paused = pause;
                consumer.acknowledged
            };

            if acknowledged {
                if pause {
                    self.router.pause_consumer(consumer_id).await?;
                } else {
                    self.router.resume_consumer(consumer_id).await?;
                }
            }
        }
        Ok(())
    }

    /// `producer-closed`: close the producer and sweep its consumers.
    fn on_producer_closed(
        &mut self,
        participant_id: &str,
        producer_id: &str,
    ) -> Result<(), SfuError> {
        self.session_mut(participant_id)?
            .remove_producer(producer_id)
            .ok_or_else(|| SfuError::UnknownProducer(producer_id.to_string()))?;

        self.router.close_producer(producer_id);
        let swept = fanout::sweep_producer(&mut self.participants, producer_id);

        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            consumers_closed = swept.len(),
            "Producer closed"
        );
        Ok(())
    }

    async fn on_producer_paused(
        &mut self,
        participant_id: &str,
        producer_id: &str,
        pause: bool,
    ) -> Result<(), SfuError> {
        let record = self.session_mut(participant_id)?.require_producer_mut(producer_id)?;
        if record.paused == pause {
            return Ok(());
        }

        if pause {
            self.router.pause_producer(producer_id).await?;
        } else {
            self.router.resume_producer(producer_id).await?;
        }
        self.session_mut(participant_id)?
            .require_producer_mut(producer_id)?
            .paused = pause;
        Ok(())
    }

    // ========================================================================
    // Acknowledgements and fan-out
    // ========================================================================

    /// The joiner acknowledged its roster: consume everything already produced.
    async fn handle_join_ack(
        &mut self,
        participant_id: &str,
        session_id: Uuid,
    ) -> Result<(), SfuError> {
        let Some(session) = self.participants.get_mut(participant_id) else {
            debug!(
                target: "sfu.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Roster acknowledged after participant left"
            );
            return Ok(());
        };
        if session.session_id() != session_id {
            return Ok(());
        }
        if !session.mark_synced()? {
            return Ok(());
        }

        let producers = fanout::producers_for_joiner(&self.participants, participant_id);
        debug!(
            target: "sfu.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            producers = producers.len(),
            "Creating initial consumers"
        );
        for producer in &producers {
            self.fan_out(participant_id, producer).await;
        }
        Ok(())
    }

    /// One consumer creation, isolated so a failure skips only this pair.
    async fn fan_out(&mut self, consuming_id: &str, producer: &ProducerInfo) {
        let ctx = self
            .context("make-consumer")
            .participant(consuming_id.to_string());
        let Some(session) = self.participants.get_mut(consuming_id) else {
            return;
        };

        let created = isolate(
            ctx,
            fanout::create_consumer(self.router.as_ref(), session, producer),
        )
        .await;

        if let Some(Some(pending)) = created {
            self.watch_consumer_ack(pending);
        }
    }

    fn watch_consumer_ack(&self, pending: PendingConsumerAck) {
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let PendingConsumerAck {
                participant_id,
                session_id,
                consumer_id,
                ack,
            } = pending;
            // A closed connection drops the ack; disconnect cleans up
            let Ok(reply) = ack.await else {
                return;
            };
            let _ = sender
                .send(RoomMessage::ConsumerAcknowledged {
                    participant_id,
                    session_id,
                    consumer_id,
                    accepted: reply != Value::Bool(false),
                })
                .await;
        });
    }

    /// The client is ready for the consumer: resume it unless it asked for
    /// a pause meanwhile, then report its current score.
    async fn handle_consumer_ack(
        &mut self,
        participant_id: &str,
        session_id: Uuid,
        consumer_id: &str,
        accepted: bool,
    ) -> Result<(), SfuError> {
        let Some(session) = self.participants.get_mut(participant_id) else {
            return Ok(());
        };
        if session.session_id() != session_id {
            return Ok(());
        }
        let Some(consumer) = session.consumer_mut(consumer_id) else {
            debug!(
                target: "sfu.room",
                room_id = %self.room_id,
                consumer_id = %consumer_id,
                "Consumer closed before acknowledgement"
            );
            return Ok(());
        };
        if consumer.acknowledged {
            return Ok(());
        }
        consumer.acknowledged = true;
        if !accepted {
            // Treated as a client pause so a later consumers-resumed reaches the engine
            consumer.client_paused = true;
            debug!(
                target: "sfu.room",
                room_id = %self.room_id,
                consumer_id = %consumer_id,
                "Client declined consumer, leaving it paused"
            );
            return Ok(());
        }
        let client_paused = consumer.client_paused;

        if !client_paused {
            self.router.resume_consumer(consumer_id).await?;
        }

        if let Some(score) = self.router.consumer_score(consumer_id) {
            self.session(participant_id)?
                .emit(ServerEvent::ConsumerScore(ScoreReport {
                    id: consumer_id.to_string(),
                    score,
                }));
        }
        Ok(())
    }

    // ========================================================================
    // Disconnect and close
    // ========================================================================

    #[instrument(skip_all, fields(room_id = %self.room_id, participant_id = %participant_id))]
    async fn handle_disconnect(
        &mut self,
        participant_id: &str,
        session_id: Uuid,
        reason: DisconnectReason,
    ) {
        match self.participants.get(participant_id) {
            Some(session) if session.session_id() == session_id => {}
            Some(_) => {
                debug!(
                    target: "sfu.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    "Ignoring disconnect of a stale session"
                );
                return;
            }
            None => return,
        }
        let Some(mut session) = self.participants.remove(participant_id) else {
            return;
        };

        let was_joined = session.is_joined();
        session.mark_disconnected();

        let mut consumers_closed = 0;
        for producer_id in session.producer_ids() {
            self.router.close_producer(&producer_id);
            consumers_closed += fanout::sweep_producer(&mut self.participants, &producer_id).len();
        }
        for transport_id in session.transport_ids() {
            self.router.close_transport(transport_id);
        }
        session.channel().disconnect();

        if was_joined {
            self.broadcast(
                None,
                &ServerEvent::ParticipantLeft(ParticipantRef {
                    participant_id: participant_id.to_string(),
                }),
            );
        }
        if self.active_speaker.as_deref() == Some(participant_id) {
            self.active_speaker = None;
            self.broadcast(None, &ServerEvent::ActiveSpeaker(ActiveSpeaker::default()));
        }

        self.persist_membership(MembershipOp::Remove(participant_id.to_string()));
        self.metrics.participant_removed();

        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            reason = reason.as_str(),
            consumers_closed,
            session_secs = session.age().as_secs(),
            remaining = self.participants.len(),
            "Participant left"
        );

        if self.participants.is_empty() {
            self.self_close("last participant left").await;
        }
    }

    /// Deregister, then close the router. The run loop exits afterwards.
    async fn self_close(&mut self, reason: &'static str) {
        self.closed = true;

        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            reason,
            "Room empty, closing"
        );

        if self
            .registry
            .send(RegistryMessage::RoomEmptied {
                room_id: self.room_id.clone(),
                incarnation: self.incarnation,
            })
            .await
            .is_err()
        {
            debug!(
                target: "sfu.room",
                room_id = %self.room_id,
                "Registry gone before room deregistered"
            );
        }

        self.router.close();
    }

    /// Answer whatever is still queued once the room stopped serving.
    fn reject_queued(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                RoomMessage::AddParticipant { respond_to, .. } => {
                    let _ = respond_to.send(Err(SfuError::RoomClosed));
                }
                RoomMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state());
                }
                other => {
                    debug!(
                        target: "sfu.room",
                        room_id = %self.room_id,
                        message = other.name(),
                        "Dropping message for closed room"
                    );
                }
            }
        }
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            participants = self.participants.len(),
            "Performing graceful shutdown"
        );

        self.closed = true;

        let sessions: Vec<ParticipantSession> =
            self.participants.drain().map(|(_, s)| s).collect();
        for mut session in sessions {
            session.mark_disconnected();
            session.channel().disconnect();
            self.persist_membership(MembershipOp::Remove(session.participant_id().to_string()));
            self.metrics.participant_removed();
        }

        // Closing the router closes every transport, producer and consumer
        self.router.close();

        info!(
            target: "sfu.room",
            room_id = %self.room_id,
            "Graceful shutdown complete"
        );
    }

    // ========================================================================
    // Engine events
    // ========================================================================

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        let ctx = self.context(event.name());
        isolate(ctx, async { self.dispatch_engine_event(event) }).await;
    }

    fn dispatch_engine_event(&mut self, event: EngineEvent) -> Result<(), SfuError> {
        match event {
            EngineEvent::ProducerClosed { producer_id } => {
                // Already handled if the room closed it itself
                if let Some(owner) = fanout::producer_owner(&self.participants, &producer_id) {
                    self.session_mut(&owner)?.remove_producer(&producer_id);
                    fanout::sweep_producer(&mut self.participants, &producer_id);
                }
            }

            EngineEvent::ProducerScore { producer_id, score } => {
                if let Some(owner) = fanout::producer_owner(&self.participants, &producer_id) {
                    self.session(&owner)?
                        .emit(ServerEvent::ProducerScore(ScoreReport {
                            id: producer_id,
                            score,
                        }));
                }
            }

            EngineEvent::ConsumerClosed { consumer_id, cause } => {
                if let Some(owner) = fanout::consumer_owner(&self.participants, &consumer_id) {
                    let session = self.session_mut(&owner)?;
                    session.remove_consumer(&consumer_id);
                    session.emit(ServerEvent::ConsumerClosed(ConsumerRef {
                        consumer_id: consumer_id.clone(),
                    }));
                    debug!(
                        target: "sfu.room",
                        room_id = %self.room_id,
                        consumer_id = %consumer_id,
                        cause = ?cause,
                        "Consumer closed by engine"
                    );
                }
            }

            EngineEvent::ConsumerProducerPaused { consumer_id } => {
                self.set_producer_paused(&consumer_id, true)?;
            }

            EngineEvent::ConsumerProducerResumed { consumer_id } => {
                self.set_producer_paused(&consumer_id, false)?;
            }

            EngineEvent::ConsumerScore { consumer_id, score } => {
                if let Some(owner) = fanout::consumer_owner(&self.participants, &consumer_id) {
                    let session = self.session(&owner)?;
                    // Scores follow the resume, not the creation
                    if session
                        .consumer(&consumer_id)
                        .is_some_and(|c| c.acknowledged)
                    {
                        session.emit(ServerEvent::ConsumerScore(ScoreReport {
                            id: consumer_id,
                            score,
                        }));
                    }
                }
            }

            EngineEvent::ConsumerLayersChanged {
                consumer_id,
                layers,
            } => {
                if let Some(owner) = fanout::consumer_owner(&self.participants, &consumer_id) {
                    self.session(&owner)?
                        .emit(ServerEvent::ConsumerLayersChanged(LayersChanged {
                            consumer_id,
                            spatial_layer: layers.map(|l| l.spatial_layer),
                            temporal_layer: layers.and_then(|l| l.temporal_layer),
                        }));
                }
            }

            EngineEvent::AudioVolumes { volumes } => {
                let Some(loudest) = volumes.first() else {
                    return Ok(());
                };
                let speaker = fanout::producer_owner(&self.participants, &loudest.producer_id);
                if speaker.is_some() && speaker != self.active_speaker {
                    self.active_speaker.clone_from(&speaker);
                    self.broadcast(
                        None,
                        &ServerEvent::ActiveSpeaker(ActiveSpeaker {
                            participant_id: speaker,
                            volume: Some(loudest.volume),
                        }),
                    );
                }
            }

            EngineEvent::Silence => {
                if self.active_speaker.take().is_some() {
                    self.broadcast(None, &ServerEvent::ActiveSpeaker(ActiveSpeaker::default()));
                }
            }
        }
        Ok(())
    }

    fn set_producer_paused(&mut self, consumer_id: &str, paused: bool) -> Result<(), SfuError> {
        let Some(owner) = fanout::consumer_owner(&self.participants, consumer_id) else {
            return Ok(());
        };
        let session = self.session_mut(&owner)?;
        if let Some(consumer) = session.consumer_mut(consumer_id) {
            consumer.producer_paused = paused;
        }
        let consumer = ConsumerRef {
            consumer_id: consumer_id.to_string(),
        };
        session.emit(if paused {
            ServerEvent::ConsumerPaused(consumer)
        } else {
            ServerEvent::ConsumerResumed(consumer)
        });
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Emit to every session except `except`.
    fn broadcast(&self, except: Option<&str>, event: &ServerEvent) {
        for session in self.participants.values() {
            if Some(session.participant_id()) != except {
                session.emit(event.clone());
            }
        }
    }

    fn persist_membership(&self, op: MembershipOp) {
        if let Some(tx) = &self.membership_tx {
            let _ = tx.send(op);
        }
    }

    /// Close the membership queue and wait for pending writes.
    async fn flush_membership(&mut self) {
        self.membership_tx = None;
        let Some(task) = self.membership_task.take() else {
            return;
        };
        if tokio::time::timeout(MEMBERSHIP_FLUSH_TIMEOUT, task)
            .await
            .is_err()
        {
            warn!(
                target: "sfu.room",
                room_id = %self.room_id,
                "Timed out flushing membership writes"
            );
        }
    }

    fn state(&self) -> RoomState {
        let mut participants: Vec<_> = self
            .participants
            .values()
            .map(ParticipantSession::snapshot)
            .collect();
        participants.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));

        RoomState {
            room_id: self.room_id.clone(),
            incarnation: self.incarnation,
            router_id: self.router.id(),
            active_speaker: self.active_speaker.clone(),
            participants,
        }
    }
}

fn spawn_membership_writer(
    room_id: String,
    store: Arc<dyn MembershipStore>,
) -> (mpsc::UnboundedSender<MembershipOp>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<MembershipOp>();
    let task = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            let (name, participant_id, result) = match op {
                MembershipOp::Add(participant_id) => {
                    let result = store.add_member(&room_id, &participant_id).await;
                    ("add", participant_id, result)
                }
                MembershipOp::Remove(participant_id) => {
                    let result = store.remove_member(&room_id, &participant_id).await;
                    ("remove", participant_id, result)
                }
            };
            if let Err(e) = result {
                warn!(
                    target: "sfu.room",
                    room_id = %room_id,
                    participant_id = %participant_id,
                    operation = name,
                    error = %e,
                    "Failed to persist room membership"
                );
            }
        }
    });
    (tx, task)
}
