//! Authorization gate.
//!
//! Permissions are an explicit tagged set; every authorization decision is
//! a pure function over [`Grants`]. Lookups against the identity store
//! happen once at admission, so produce-time checks never suspend.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::engine::MediaKind;

/// A capability a participant may hold in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    /// May produce audio.
    Speak,
    /// May produce video.
    ShareVideo,
}

impl Permission {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Permission::Speak => "speak",
            Permission::ShareVideo => "shareVideo",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "speak" => Ok(Permission::Speak),
            "shareVideo" => Ok(Permission::ShareVideo),
            other => Err(format!("unknown permission: {other}")),
        }
    }
}

/// Authorization state of one participant in one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grants {
    pub is_admin: bool,
    pub permissions: HashSet<Permission>,
}

impl Grants {
    /// Grants for a room administrator.
    #[must_use]
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            permissions: HashSet::new(),
        }
    }

    /// Non-admin grants holding exactly `permissions`.
    #[must_use]
    pub fn with_permissions(permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            is_admin: false,
            permissions: permissions.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn has(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Whether a participant may produce media of `kind`.
#[must_use]
pub fn can_produce(grants: &Grants, kind: MediaKind) -> bool {
    grants.is_admin
        || (kind == MediaKind::Audio && grants.has(Permission::Speak))
        || (kind == MediaKind::Video && grants.has(Permission::ShareVideo))
}

/// Whether a joining participant gets a producer transport.
#[must_use]
pub fn may_open_producer_transport(allow_produce: bool, grants: &Grants) -> bool {
    allow_produce
        && (grants.is_admin
            || grants.has(Permission::Speak)
            || grants.has(Permission::ShareVideo))
}

/// Parse store strings into a permission set. Unknown entries are skipped.
pub fn parse_permissions<I, S>(raw: I) -> HashSet<Permission>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .filter_map(|s| match s.as_ref().parse::<Permission>() {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::debug!(target: "sfu.store", error = %e, "Ignoring permission");
                None
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_may_produce_everything() {
        let grants = Grants::admin();
        assert!(can_produce(&grants, MediaKind::Audio));
        assert!(can_produce(&grants, MediaKind::Video));
    }

    #[test]
    fn test_speak_allows_audio_only() {
        let grants = Grants::with_permissions([Permission::Speak]);
        assert!(can_produce(&grants, MediaKind::Audio));
        assert!(!can_produce(&grants, MediaKind::Video));
    }

    #[test]
    fn test_share_video_allows_video_only() {
        let grants = Grants::with_permissions([Permission::ShareVideo]);
        assert!(!can_produce(&grants, MediaKind::Audio));
        assert!(can_produce(&grants, MediaKind::Video));
    }

    #[test]
    fn test_no_grants_produce_nothing() {
        let grants = Grants::default();
        assert!(!can_produce(&grants, MediaKind::Audio));
        assert!(!can_produce(&grants, MediaKind::Video));
    }

    #[test]
    fn test_producer_transport_predicate() {
        let listener = Grants::default();
        let speaker = Grants::with_permissions([Permission::Speak]);
        let presenter = Grants::with_permissions([Permission::ShareVideo]);
        let admin = Grants::admin();

        assert!(!may_open_producer_transport(true, &listener));
        assert!(may_open_producer_transport(true, &speaker));
        assert!(may_open_producer_transport(true, &presenter));
        assert!(may_open_producer_transport(true, &admin));

        // allow_produce=false overrides every grant
        assert!(!may_open_producer_transport(false, &admin));
        assert!(!may_open_producer_transport(false, &speaker));
    }

    #[test]
    fn test_permission_parsing() {
        assert_eq!("speak".parse::<Permission>().unwrap(), Permission::Speak);
        assert_eq!(
            "shareVideo".parse::<Permission>().unwrap(),
            Permission::ShareVideo
        );
        assert!("share_video".parse::<Permission>().is_err());

        let parsed = parse_permissions(["speak", "moderate", "shareVideo"]);
        assert_eq!(parsed.len(), 2);
        assert!(parsed.contains(&Permission::Speak));
        assert!(parsed.contains(&Permission::ShareVideo));
    }
}
