//! Permission objects and the store they are read from

use crate::{action::Transaction, Authority};
use alloy_primitives::B256;
use auto_impl::auto_impl;
use quorum_primitives::{Name, PermissionLevel};
use serde::{Deserialize, Serialize};

/// Identifier of a permission object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PermissionId(pub u64);

impl PermissionId {
    /// Sentinel parent of every account's root (`owner`) permission.
    pub const ROOT: Self = Self(0);
}

/// A named authority on an account, arranged in a per-account tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// Object id
    pub id: PermissionId,
    /// Parent permission, [`PermissionId::ROOT`] for `owner`
    pub parent: PermissionId,
    /// Owning account
    pub owner: Name,
    /// Permission name
    pub name: Name,
    /// Current authority
    pub auth: Authority,
    /// Microseconds timestamp of the last `updateauth`
    pub last_updated: u64,
    /// Microseconds timestamp of the last successful use (usage companion object)
    pub last_used: u64,
}

impl Permission {
    /// The `(owner, name)` level of this permission.
    pub fn level(&self) -> PermissionLevel {
        PermissionLevel { actor: self.owner.clone(), permission: self.name.clone() }
    }

    /// Returns true if this permission is `other` or one of its ancestors.
    ///
    /// Authority over a parent implies authority over all of its children.
    pub fn satisfies<S: PermissionStore + ?Sized>(&self, other: &Self, store: &S) -> bool {
        if self.owner != other.owner {
            return false;
        }
        if self.id == other.id || self.id == other.parent {
            return true;
        }
        let mut parent = store.find_permission_by_id(other.parent);
        while let Some(current) = parent {
            if self.id == current.parent {
                return true;
            }
            if current.parent == PermissionId::ROOT {
                return false;
            }
            parent = store.find_permission_by_id(current.parent);
        }
        false
    }
}

/// A delayed transaction waiting for execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTransaction {
    /// Transaction id
    pub trx_id: B256,
    /// Scheduling contract; empty for user-delayed transactions
    pub sender: Name,
    /// Microseconds timestamp at which the transaction becomes executable
    pub delay_until: u64,
    /// Microseconds timestamp at which the transaction was scheduled
    pub published: u64,
    /// The scheduled transaction
    pub transaction: Transaction,
}

/// Read access to permissions, permission links and delayed transactions.
///
/// Backed by the chain's object store. The authorization code never writes through it.
#[auto_impl(&, Arc)]
pub trait PermissionStore {
    /// Look up a permission by `(owner, name)`.
    fn find_permission(&self, level: &PermissionLevel) -> Option<Permission>;

    /// Look up a permission by id.
    fn find_permission_by_id(&self, id: PermissionId) -> Option<Permission>;

    /// The permission explicitly linked for `(account, code, action)`, if any.
    ///
    /// An empty `action` name addresses the contract-wide default link.
    fn find_link(&self, account: &Name, code: &Name, action: &Name) -> Option<Name>;

    /// Look up a delayed transaction by id.
    fn find_generated_transaction(&self, trx_id: &B256) -> Option<GeneratedTransaction>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryPermissionStore;

    #[test]
    fn test_satisfies_self_and_descendants_only() {
        let mut store = MemoryPermissionStore::default();
        let owner = store.add_permission("alice", "owner", "", Authority::default());
        let active = store.add_permission("alice", "active", "owner", Authority::default());
        let trade = store.add_permission("alice", "trade", "active", Authority::default());
        let bob = store.add_permission("bob", "owner", "", Authority::default());

        assert!(owner.satisfies(&owner, &store));
        assert!(owner.satisfies(&active, &store));
        assert!(owner.satisfies(&trade, &store));
        assert!(active.satisfies(&trade, &store));

        assert!(!trade.satisfies(&active, &store));
        assert!(!active.satisfies(&owner, &store));
        assert!(!bob.satisfies(&trade, &store));
    }
}
