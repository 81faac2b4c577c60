//! Account, permission and action names

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt};

/// A name identifying an account, a permission or an action.
///
/// Names order lexicographically. That order is consensus relevant: authorization obligations
/// are verified in ascending `(actor, permission)` order on every node.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Name(Cow<'static, str>);

impl Name {
    /// The system account that owns the native authorization actions.
    pub const SYSTEM: Self = Self::from_static("eosio");
    /// Root permission of every account.
    pub const OWNER: Self = Self::from_static("owner");
    /// Default permission required when no link exists.
    pub const ACTIVE: Self = Self::from_static("active");
    /// Wildcard permission: linking to it means "no permission required".
    pub const ANY: Self = Self::from_static("eosio.any");

    /// `updateauth` native action.
    pub const UPDATEAUTH: Self = Self::from_static("updateauth");
    /// `deleteauth` native action.
    pub const DELETEAUTH: Self = Self::from_static("deleteauth");
    /// `linkauth` native action.
    pub const LINKAUTH: Self = Self::from_static("linkauth");
    /// `unlinkauth` native action.
    pub const UNLINKAUTH: Self = Self::from_static("unlinkauth");
    /// `canceldelay` native action.
    pub const CANCELDELAY: Self = Self::from_static("canceldelay");

    /// Create a name from a static string without allocating.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Create a name from any string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// The empty name, used for "no sender" and contract-wide link defaults.
    pub const fn empty() -> Self {
        Self::from_static("")
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the empty name.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&'static str> for Name {
    fn from(name: &'static str) -> Self {
        Self::from_static(name)
    }
}

impl From<String> for Name {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// A named authority slot on an account.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionLevel {
    /// Account holding the permission
    pub actor: Name,
    /// Permission name on that account
    pub permission: Name,
}

impl PermissionLevel {
    /// Create a new permission level
    pub fn new(actor: impl Into<Name>, permission: impl Into<Name>) -> Self {
        Self { actor: actor.into(), permission: permission.into() }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.actor, self.permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_and_static_names_compare_equal() {
        assert_eq!(Name::new("active"), Name::ACTIVE);
        assert_eq!(Name::from("eosio.any"), Name::ANY);
    }

    #[test]
    fn test_permission_levels_order_by_actor_then_permission() {
        let mut levels = vec![
            PermissionLevel::new("bob", "active"),
            PermissionLevel::new("alice", "owner"),
            PermissionLevel::new("alice", "active"),
        ];
        levels.sort();
        assert_eq!(levels[0], PermissionLevel::new("alice", "active"));
        assert_eq!(levels[1], PermissionLevel::new("alice", "owner"));
        assert_eq!(levels[2], PermissionLevel::new("bob", "active"));
    }

    #[test]
    fn test_name_serializes_as_plain_string() {
        let level = PermissionLevel::new("alice", "active");
        let json = serde_json::to_string(&level).unwrap();
        assert_eq!(json, r#"{"actor":"alice","permission":"active"}"#);
        let back: PermissionLevel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, level);
        assert_eq!(level.to_string(), "alice@active");
    }
}
