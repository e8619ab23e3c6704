//! Permission system — granular, transparent, no hidden gotchas.
//!
//! Permissions are plain strings rather than a bitfield. `"*"` grants
//! everything at its scope. Checks are exact string matches (or the
//! wildcard). This trades the compactness of a bitfield for a permission
//! surface that's easy to extend without a central enum, and easy to log.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Wildcard permission string — grants every permission at its scope.
pub const WILDCARD: &str = "*";

/// The scope a role's permissions apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoleScope {
    Server,
    ChannelWebrtc,
    ChannelSignal,
}

/// A set of permission strings, with wildcard semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(pub HashSet<String>);

impl PermissionSet {
    pub fn new() -> Self {
        Self(HashSet::new())
    }

    pub fn from_iter(perms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(perms.into_iter().map(Into::into).collect())
    }

    pub fn all() -> Self {
        let mut s = HashSet::new();
        s.insert(WILDCARD.to_string());
        Self(s)
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.contains(WILDCARD)
    }

    /// `"*"` short-circuits true; otherwise an exact match.
    pub fn has(&self, permission: &str) -> bool {
        self.is_wildcard() || self.0.contains(permission)
    }

    pub fn merge(&mut self, other: &PermissionSet) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn union(mut self, other: &PermissionSet) -> Self {
        self.merge(other);
        self
    }
}

/// Standard, seeded role names — immutable and undeletable.
pub const STANDARD_SERVER_ROLES: &[(&str, &[&str])] = &[
    ("Administrator", &[WILDCARD]),
    ("Moderator", &["block.manage", "abuse.review", "invitation.issue"]),
    ("User", &["register.complete", "envelope.send", "envelope.fetch", "signaling.connect"]),
];

pub const STANDARD_CHANNEL_WEBRTC_ROLES: &[(&str, &[&str])] = &[
    ("Channel Owner", &[WILDCARD]),
    ("Channel Moderator", &["room.admit", "room.disconnect_peer", "room.set_slots"]),
    ("Channel Member", &["room.join", "room.offer", "room.answer"]),
];

pub const STANDARD_CHANNEL_SIGNAL_ROLES: &[(&str, &[&str])] = &[
    ("Channel Owner", &[WILDCARD]),
    ("Channel Moderator", &["senderkey.manage", "member.remove"]),
    ("Channel Member", &["senderkey.upload", "senderkey.fetch", "group.send"]),
];

/// Evaluate whether a member may perform `permission` on a channel.
///
/// Algorithm (kept from the bitflag-era `compute_permissions`, re-expressed
/// over string sets):
/// 1. Channel owner bypasses every check.
/// 2. Union of all of the member's role permission sets.
/// 3. `"*"` in the union short-circuits true.
/// 4. Otherwise exact match against `permission`.
pub fn member_has_permission(
    permission: &str,
    member_id: Uuid,
    channel_owner_id: Uuid,
    member_role_permissions: &[PermissionSet],
) -> bool {
    if member_id == channel_owner_id {
        return true;
    }

    let effective = member_role_permissions
        .iter()
        .fold(PermissionSet::new(), |acc, set| acc.union(set));

    effective.has(permission)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_grants_everything() {
        let perms = PermissionSet::all();
        assert!(perms.has("anything.at.all"));
    }

    #[test]
    fn exact_match_required_without_wildcard() {
        let perms = PermissionSet::from_iter(["envelope.send"]);
        assert!(perms.has("envelope.send"));
        assert!(!perms.has("envelope.fetch"));
    }

    #[test]
    fn channel_owner_bypasses_role_check() {
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert!(member_has_permission("anything", owner, owner, &[]));
        assert!(!member_has_permission("anything", other, owner, &[]));
    }

    #[test]
    fn union_of_roles_is_checked() {
        let member = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let roles = vec![
            PermissionSet::from_iter(["room.join"]),
            PermissionSet::from_iter(["room.offer"]),
        ];
        assert!(member_has_permission("room.offer", member, owner, &roles));
        assert!(!member_has_permission("room.admit", member, owner, &roles));
    }
}
