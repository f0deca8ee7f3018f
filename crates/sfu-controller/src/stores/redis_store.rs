//! Redis-backed identity and membership store.
//!
//! # Key Patterns
//!
//! - `sfu:session:{token}` - Identity JSON (`{userId, displayName?, isAdmin}`)
//! - `sfu:room:{room}:admins` - SET of admin user ids
//! - `sfu:room:{room}:permissions:{user}` - SET of permission names
//! - `sfu:room:{room}:members` - SET of joined participant ids
//!
//! # Connection Pattern
//!
//! `MultiplexedConnection` is cheap to clone and safe to use concurrently,
//! so each call clones it instead of locking.

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

use super::{Identity, IdentityStore, MembershipStore};
use crate::errors::SfuError;
use crate::observability::metrics::record_redis_latency;
use crate::permissions::{parse_permissions, Grants};

fn session_key(token: &str) -> String {
    format!("sfu:session:{token}")
}

fn admins_key(room_id: &str) -> String {
    format!("sfu:room:{room_id}:admins")
}

fn permissions_key(room_id: &str, user_id: &str) -> String {
    format!("sfu:room:{room_id}:permissions:{user_id}")
}

fn members_key(room_id: &str) -> String {
    format!("sfu:room:{room_id}:members")
}

/// Redis implementation of [`IdentityStore`] and [`MembershipStore`].
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `SfuError::Redis` if the client cannot open or connect.
    pub async fn connect(redis_url: &str) -> Result<Self, SfuError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Never log redis_url; it may carry credentials
            error!(
                target: "sfu.store",
                error = %e,
                "Failed to open Redis client"
            );
            SfuError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "sfu.store",
                    error = %e,
                    "Failed to connect to Redis"
                );
                SfuError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { connection })
    }
}

#[async_trait::async_trait]
impl IdentityStore for RedisStore {
    #[instrument(skip_all, name = "sfu.store.resolve_session")]
    async fn resolve_session(&self, token: &str) -> Result<Option<Identity>, SfuError> {
        let mut conn = self.connection.clone();
        let start = Instant::now();

        let raw: Option<String> = conn.get(session_key(token)).await.map_err(|e| {
            warn!(target: "sfu.store", error = %e, "Failed to read session");
            SfuError::Redis(format!("Failed to read session: {e}"))
        })?;
        record_redis_latency("get", start.elapsed());

        let Some(raw) = raw else {
            debug!(target: "sfu.store", "Session token not found");
            return Ok(None);
        };

        match serde_json::from_str::<Identity>(&raw) {
            Ok(identity) => Ok(Some(identity)),
            Err(e) => {
                warn!(target: "sfu.store", error = %e, "Malformed session record");
                Ok(None)
            }
        }
    }

    #[instrument(skip_all, name = "sfu.store.grants", fields(room_id = %room_id, user_id = %identity.user_id))]
    async fn grants(&self, identity: &Identity, room_id: &str) -> Result<Grants, SfuError> {
        let mut conn = self.connection.clone();
        let start = Instant::now();

        let room_admin: bool = conn
            .sismember(admins_key(room_id), &identity.user_id)
            .await
            .map_err(|e| {
                warn!(target: "sfu.store", error = %e, "Failed to read room admins");
                SfuError::Redis(format!("Failed to read room admins: {e}"))
            })?;
        record_redis_latency("sismember", start.elapsed());

        let start = Instant::now();
        let raw: Vec<String> = conn
            .smembers(permissions_key(room_id, &identity.user_id))
            .await
            .map_err(|e| {
                warn!(target: "sfu.store", error = %e, "Failed to read permissions");
                SfuError::Redis(format!("Failed to read permissions: {e}"))
            })?;
        record_redis_latency("smembers", start.elapsed());

        Ok(Grants {
            is_admin: identity.is_admin || room_admin,
            permissions: parse_permissions(raw),
        })
    }
}

#[async_trait::async_trait]
impl MembershipStore for RedisStore {
    #[instrument(skip_all, name = "sfu.store.add_member", fields(room_id = %room_id, participant_id = %participant_id))]
    async fn add_member(&self, room_id: &str, participant_id: &str) -> Result<(), SfuError> {
        let mut conn = self.connection.clone();
        let start = Instant::now();

        let _: i64 = conn
            .sadd(members_key(room_id), participant_id)
            .await
            .map_err(|e| SfuError::Redis(format!("Failed to add member: {e}")))?;
        record_redis_latency("sadd", start.elapsed());
        Ok(())
    }

    #[instrument(skip_all, name = "sfu.store.remove_member", fields(room_id = %room_id, participant_id = %participant_id))]
    async fn remove_member(&self, room_id: &str, participant_id: &str) -> Result<(), SfuError> {
        let mut conn = self.connection.clone();
        let start = Instant::now();

        let _: i64 = conn
            .srem(members_key(room_id), participant_id)
            .await
            .map_err(|e| SfuError::Redis(format!("Failed to remove member: {e}")))?;
        record_redis_latency("srem", start.elapsed());
        Ok(())
    }
}
