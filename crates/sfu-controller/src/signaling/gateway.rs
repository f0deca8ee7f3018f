//! Connection admission.
//!
//! Admission happens in two steps so the WebSocket server can refuse a bad
//! token with a plain HTTP status before upgrading:
//!
//! 1. [`SignalingGateway::authenticate`] resolves the token and the
//!    participant's grants in the requested room.
//! 2. [`SignalingGateway::join`] gets or creates the room and adds the
//!    participant, retrying when it raced with the room closing itself.

use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::actors::{AddOutcome, JoinOptions, RoomHandle, RoomRegistryHandle};
use crate::errors::SfuError;
use crate::stores::IdentityStore;

use super::SignalingChannel;

/// Attempts at joining a room that keeps closing underneath the join.
const MAX_JOIN_ATTEMPTS: usize = 3;

/// An authenticated, not yet joined connection.
#[derive(Debug, Clone)]
pub struct AdmissionTicket {
    pub room_id: String,
    pub participant_id: String,
    pub options: JoinOptions,
}

/// A participant session bound to a room.
#[derive(Debug, Clone)]
pub struct JoinedSession {
    pub room: RoomHandle,
    pub participant_id: String,
    pub session_id: Uuid,
}

/// Resolves identities and places connections into rooms.
pub struct SignalingGateway {
    registry: RoomRegistryHandle,
    identity: Arc<dyn IdentityStore>,
    allow_produce: bool,
    allow_consume: bool,
}

impl SignalingGateway {
    #[must_use]
    pub fn new(
        registry: RoomRegistryHandle,
        identity: Arc<dyn IdentityStore>,
        allow_produce: bool,
        allow_consume: bool,
    ) -> Self {
        Self {
            registry,
            identity,
            allow_produce,
            allow_consume,
        }
    }

    /// Resolve `token` and the grants for `room_id`.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for an unknown token, `PolicyRejected` for an empty
    /// room id, `Redis` if the store is unreachable.
    #[instrument(skip_all, name = "sfu.signaling.authenticate", fields(room_id = %room_id))]
    pub async fn authenticate(
        &self,
        room_id: &str,
        token: &str,
    ) -> Result<AdmissionTicket, SfuError> {
        if room_id.trim().is_empty() {
            return Err(SfuError::PolicyRejected("missing room id".to_string()));
        }

        let identity = self
            .identity
            .resolve_session(token)
            .await?
            .ok_or(SfuError::Unauthorized)?;
        let grants = self.identity.grants(&identity, room_id).await?;

        debug!(
            target: "sfu.signaling",
            room_id = %room_id,
            participant_id = %identity.user_id,
            is_admin = grants.is_admin,
            permissions = grants.permissions.len(),
            "Connection authenticated"
        );

        Ok(AdmissionTicket {
            room_id: room_id.to_string(),
            participant_id: identity.user_id,
            options: JoinOptions {
                allow_produce: self.allow_produce,
                allow_consume: self.allow_consume,
                grants,
            },
        })
    }

    /// Add the authenticated participant to its room.
    ///
    /// Returns `Ok(None)` when the participant already has a session in the
    /// room; the caller should close the new connection.
    #[instrument(skip_all, name = "sfu.signaling.join", fields(room_id = %ticket.room_id, participant_id = %ticket.participant_id))]
    pub async fn join(
        &self,
        ticket: &AdmissionTicket,
        channel: Arc<dyn SignalingChannel>,
    ) -> Result<Option<JoinedSession>, SfuError> {
        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            let room = self.registry.get_or_create(&ticket.room_id).await?;

            match room
                .add_participant(
                    ticket.participant_id.clone(),
                    Arc::clone(&channel),
                    ticket.options.clone(),
                )
                .await
            {
                Ok(AddOutcome::Added { session_id }) => {
                    info!(
                        target: "sfu.signaling",
                        room_id = %ticket.room_id,
                        participant_id = %ticket.participant_id,
                        connection_id = %channel.id(),
                        "Connection joined room"
                    );
                    return Ok(Some(JoinedSession {
                        room,
                        participant_id: ticket.participant_id.clone(),
                        session_id,
                    }));
                }
                Ok(AddOutcome::AlreadyPresent) => return Ok(None),
                Err(SfuError::RoomClosed) => {
                    debug!(
                        target: "sfu.signaling",
                        room_id = %ticket.room_id,
                        attempt,
                        "Room closed during join, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(SfuError::RoomClosed)
    }

    /// Authenticate and join in one step.
    pub async fn admit(
        &self,
        room_id: &str,
        token: &str,
        channel: Arc<dyn SignalingChannel>,
    ) -> Result<Option<JoinedSession>, SfuError> {
        let ticket = self.authenticate(room_id, token).await?;
        self.join(&ticket, channel).await
    }
}
