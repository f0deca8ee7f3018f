//! External identity, permission and membership stores.
//!
//! The core consumes these through narrow async traits. [`RedisStore`]
//! backs both in production; tests use in-memory implementations.

pub mod redis_store;

pub use redis_store::RedisStore;

use serde::{Deserialize, Serialize};

use crate::errors::SfuError;
use crate::permissions::Grants;

/// Identity resolved from a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Global administrator flag. Room admins come from [`IdentityStore::grants`].
    #[serde(default)]
    pub is_admin: bool,
}

/// Session token and permission lookups.
#[async_trait::async_trait]
pub trait IdentityStore: Send + Sync {
    /// Resolve a session token. `Ok(None)` for unknown or expired tokens.
    async fn resolve_session(&self, token: &str) -> Result<Option<Identity>, SfuError>;

    /// Resolve the grants of `identity` in `room_id`.
    async fn grants(&self, identity: &Identity, room_id: &str) -> Result<Grants, SfuError>;
}

/// Persistent room membership record.
#[async_trait::async_trait]
pub trait MembershipStore: Send + Sync {
    async fn add_member(&self, room_id: &str, participant_id: &str) -> Result<(), SfuError>;

    async fn remove_member(&self, room_id: &str, participant_id: &str) -> Result<(), SfuError>;
}
