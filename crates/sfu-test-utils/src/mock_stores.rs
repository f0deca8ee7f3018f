//! In-memory identity and membership stores.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::{MockIdentityStore, MockMembershipStore};
//!
//! let identity = MockIdentityStore::new()
//!     .with_session("tok-alice", "alice")
//!     .with_grants("alice", "room-1", Grants::with_permissions([Permission::Speak]));
//!
//! let membership = MockMembershipStore::new();
//! // ... run the room ...
//! assert!(membership.is_member("room-1", "alice"));
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sfu_controller::errors::SfuError;
use sfu_controller::permissions::Grants;
use sfu_controller::stores::{Identity, IdentityStore, MembershipStore};

// ============================================================================
// Identity
// ============================================================================

#[derive(Debug, Default)]
struct IdentityInner {
    sessions: HashMap<String, Identity>,
    /// Keyed by (user id, room id).
    grants: HashMap<(String, String), Grants>,
}

/// Token and grant lookups backed by maps.
///
/// Users without explicit grants get [`Grants::default`] (listen only);
/// identities with the global admin flag get admin grants everywhere.
#[derive(Debug, Clone, Default)]
pub struct MockIdentityStore {
    inner: Arc<Mutex<IdentityInner>>,
    unavailable: Arc<AtomicBool>,
}

impl MockIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` for a regular user.
    #[must_use]
    pub fn with_session(self, token: &str, user_id: &str) -> Self {
        self.add_session(
            token,
            Identity {
                user_id: user_id.to_string(),
                display_name: None,
                is_admin: false,
            },
        );
        self
    }

    /// Register `token` for a global administrator.
    #[must_use]
    pub fn with_admin_session(self, token: &str, user_id: &str) -> Self {
        self.add_session(
            token,
            Identity {
                user_id: user_id.to_string(),
                display_name: None,
                is_admin: true,
            },
        );
        self
    }

    #[must_use]
    pub fn with_grants(self, user_id: &str, room_id: &str, grants: Grants) -> Self {
        self.set_grants(user_id, room_id, grants);
        self
    }

    pub fn add_session(&self, token: &str, identity: Identity) {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(token.to_string(), identity);
    }

    pub fn set_grants(&self, user_id: &str, room_id: &str, grants: Grants) {
        self.inner
            .lock()
            .unwrap()
            .grants
            .insert((user_id.to_string(), room_id.to_string()), grants);
    }

    pub fn revoke_session(&self, token: &str) {
        self.inner.lock().unwrap().sessions.remove(token);
    }

    /// Simulate the store being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SfuError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SfuError::Redis("mock store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IdentityStore for MockIdentityStore {
    async fn resolve_session(&self, token: &str) -> Result<Option<Identity>, SfuError> {
        self.check_available()?;
        Ok(self.inner.lock().unwrap().sessions.get(token).cloned())
    }

    async fn grants(&self, identity: &Identity, room_id: &str) -> Result<Grants, SfuError> {
        self.check_available()?;
        if identity.is_admin {
            return Ok(Grants::admin());
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .grants
            .get(&(identity.user_id.clone(), room_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Membership
// ============================================================================

/// One recorded membership write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipOp {
    Add { room_id: String, participant_id: String },
    Remove { room_id: String, participant_id: String },
}

#[derive(Debug, Default)]
struct MembershipInner {
    members: BTreeSet<(String, String)>,
    log: Vec<MembershipOp>,
}

/// Membership set plus an ordered log of every write.
#[derive(Debug, Clone, Default)]
pub struct MockMembershipStore {
    inner: Arc<Mutex<MembershipInner>>,
    failing: Arc<AtomicBool>,
}

impl MockMembershipStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail. Failed writes are not logged.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_member(&self, room_id: &str, participant_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .members
            .contains(&(room_id.to_string(), participant_id.to_string()))
    }

    /// Members of `room_id`, sorted.
    #[must_use]
    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .members
            .iter()
            .filter(|(room, _)| room == room_id)
            .map(|(_, participant)| participant.clone())
            .collect()
    }

    #[must_use]
    pub fn log(&self) -> Vec<MembershipOp> {
        self.inner.lock().unwrap().log.clone()
    }

    fn check_failing(&self) -> Result<(), SfuError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SfuError::Redis("mock membership write failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MembershipStore for MockMembershipStore {
    async fn add_member(&self, room_id: &str, participant_id: &str) -> Result<(), SfuError> {
        self.check_failing()?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .members
            .insert((room_id.to_string(), participant_id.to_string()));
        inner.log.push(MembershipOp::Add {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
        });
        Ok(())
    }

    async fn remove_member(&self, room_id: &str, participant_id: &str) -> Result<(), SfuError> {
        self.check_failing()?;
        let mut inner = self.inner.lock().unwrap();
        inner
            .members
            .remove(&(room_id.to_string(), participant_id.to_string()));
        inner.log.push(MembershipOp::Remove {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfu_controller::permissions::Permission;

    #[tokio::test]
    async fn test_identity_lookup() {
        let store = MockIdentityStore::new()
            .with_session("tok-a", "alice")
            .with_admin_session("tok-root", "root")
            .with_grants("alice", "r1", Grants::with_permissions([Permission::Speak]));

        let alice = store.resolve_session("tok-a").await.unwrap().unwrap();
        assert!(store.grants(&alice, "r1").await.unwrap().has(Permission::Speak));
        assert_eq!(store.grants(&alice, "r2").await.unwrap(), Grants::default());

        let root = store.resolve_session("tok-root").await.unwrap().unwrap();
        assert!(store.grants(&root, "any").await.unwrap().is_admin);

        assert!(store.resolve_session("nope").await.unwrap().is_none());
        store.set_unavailable(true);
        assert!(store.resolve_session("tok-a").await.is_err());
    }

    #[tokio::test]
    async fn test_membership_log() {
        let store = MockMembershipStore::new();
        store.add_member("r1", "alice").await.unwrap();
        store.add_member("r1", "bob").await.unwrap();
        store.remove_member("r1", "alice").await.unwrap();

        assert_eq!(store.members("r1"), vec!["bob"]);
        assert_eq!(store.log().len(), 3);

        store.set_failing(true);
        assert!(store.add_member("r1", "carol").await.is_err());
        assert_eq!(store.log().len(), 3);
    }
}
