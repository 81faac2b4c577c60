//! In-memory permission store for tests and simulation.

use crate::{Authority, GeneratedTransaction, Permission, PermissionId, PermissionStore};
use alloy_primitives::B256;
use quorum_primitives::{now_micros, Name, PermissionLevel};
use std::collections::{BTreeMap, HashMap};

/// A [`PermissionStore`] backed by plain collections.
///
/// Permissions live in an arena indexed by id; id `0` is reserved for the root sentinel.
#[derive(Debug, Clone, Default)]
pub struct MemoryPermissionStore {
    permissions: Vec<Permission>,
    by_level: BTreeMap<PermissionLevel, usize>,
    links: BTreeMap<(Name, Name, Name), Name>,
    generated: HashMap<B256, GeneratedTransaction>,
}

impl MemoryPermissionStore {
    /// Insert `owner@name` under `owner@parent`, or under the root when `parent` is empty.
    ///
    /// Replaces the authority if the permission already exists.
    ///
    /// # Panics
    ///
    /// If the parent permission does not exist.
    pub fn add_permission(
        &mut self,
        owner: impl Into<Name>,
        name: impl Into<Name>,
        parent: impl Into<Name>,
        auth: Authority,
    ) -> Permission {
        let owner = owner.into();
        let name = name.into();
        let parent = parent.into();
        let level = PermissionLevel { actor: owner.clone(), permission: name.clone() };

        if let Some(&index) = self.by_level.get(&level) {
            let existing = &mut self.permissions[index];
            existing.auth = auth;
            existing.last_updated = now_micros();
            return existing.clone();
        }

        let parent = if parent.is_empty() {
            PermissionId::ROOT
        } else {
            let parent_level = PermissionLevel { actor: owner.clone(), permission: parent };
            self.find_permission(&parent_level)
                .unwrap_or_else(|| panic!("parent permission {parent_level} does not exist"))
                .id
        };

        let permission = Permission {
            id: PermissionId(self.permissions.len() as u64 + 1),
            parent,
            owner,
            name,
            auth,
            last_updated: now_micros(),
            last_used: 0,
        };
        self.by_level.insert(level, self.permissions.len());
        self.permissions.push(permission.clone());
        permission
    }

    /// Create `account@owner` and `account@active` beneath it.
    pub fn add_account(&mut self, account: impl Into<Name>, owner: Authority, active: Authority) {
        let account = account.into();
        self.add_permission(account.clone(), Name::OWNER, Name::empty(), owner);
        self.add_permission(account, Name::ACTIVE, Name::OWNER, active);
    }

    /// Link `code::action` (or the whole contract when `action` is empty) to `requirement`.
    pub fn link(
        &mut self,
        account: impl Into<Name>,
        code: impl Into<Name>,
        action: impl Into<Name>,
        requirement: impl Into<Name>,
    ) {
        self.links.insert((account.into(), code.into(), action.into()), requirement.into());
    }

    /// Remove a link, returning the permission it pointed at.
    pub fn unlink(&mut self, account: &Name, code: &Name, action: &Name) -> Option<Name> {
        self.links.remove(&(account.clone(), code.clone(), action.clone()))
    }

    /// Schedule a delayed transaction.
    pub fn add_generated_transaction(&mut self, generated: GeneratedTransaction) {
        self.generated.insert(generated.trx_id, generated);
    }
}

impl PermissionStore for MemoryPermissionStore {
    fn find_permission(&self, level: &PermissionLevel) -> Option<Permission> {
        self.by_level.get(level).map(|&index| self.permissions[index].clone())
    }

    fn find_permission_by_id(&self, id: PermissionId) -> Option<Permission> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.permissions.get(index).cloned()
    }

    fn find_link(&self, account: &Name, code: &Name, action: &Name) -> Option<Name> {
        self.links.get(&(account.clone(), code.clone(), action.clone())).cloned()
    }

    fn find_generated_transaction(&self, trx_id: &B256) -> Option<GeneratedTransaction> {
        self.generated.get(trx_id).cloned()
    }
}
