//! Transaction-level authorization
//!
//! The manager turns a transaction's declared authorizations into `(permission level, delay)`
//! obligations and checks them against the provided keys. Native permission-mutating actions
//! carry bespoke rules; every other action must be declared with at least its linked minimum
//! permission, and never with more than the actor's owner chain needs.

use crate::{
    action::is_native_authorization_action, Action, ActionData, Authority, AuthorityChecker,
    AuthorizationConfig, AuthorizationError, CancelDelay, DeleteAuth, LinkAuth, Permission,
    PermissionStore, UnlinkAuth, UpdateAuth,
};
use quorum_primitives::{Name, PermissionLevel, PublicKey};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use tracing::{debug, trace};

/// Checks transaction authorization against a [`PermissionStore`].
#[derive(Debug, Clone)]
pub struct AuthorizationManager<S> {
    store: S,
    config: AuthorizationConfig,
}

impl<S: PermissionStore> AuthorizationManager<S> {
    /// Create a manager over `store`.
    pub const fn new(store: S, config: AuthorizationConfig) -> Self {
        Self { store, config }
    }

    /// The permission store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Authorization limits.
    pub const fn config(&self) -> &AuthorizationConfig {
        &self.config
    }

    /// Permission at `level`, or [`AuthorizationError::PermissionQuery`].
    pub fn get_permission(
        &self,
        level: &PermissionLevel,
    ) -> Result<Permission, AuthorizationError> {
        if level.actor.is_empty() || level.permission.is_empty() {
            return Err(AuthorizationError::PermissionQuery(level.clone()));
        }
        self.store
            .find_permission(level)
            .ok_or_else(|| AuthorizationError::PermissionQuery(level.clone()))
    }

    /// The explicit link for `(account, code, action)`, falling back to the contract-wide
    /// link `(account, code, "")`.
    pub fn lookup_linked_permission(
        &self,
        account: &Name,
        code: &Name,
        action: &Name,
    ) -> Option<Name> {
        self.store
            .find_link(account, code, action)
            .or_else(|| self.store.find_link(account, code, &Name::empty()))
    }

    /// Minimum permission `account` must declare for `code::action`.
    ///
    /// `None` means the action is linked to `eosio.any` and any permission of the account will
    /// do. Native authorization actions on the system contract have no minimum permission and
    /// asking for one is a validation error.
    pub fn lookup_minimum_permission(
        &self,
        account: &Name,
        code: &Name,
        action: &Name,
    ) -> Result<Option<Name>, AuthorizationError> {
        if *code == Name::SYSTEM && is_native_authorization_action(action) {
            return Err(AuthorizationError::ActionValidate(format!(
                "cannot look up the minimum permission of native action {code}::{action}"
            )));
        }
        Ok(match self.lookup_linked_permission(account, code, action) {
            None => Some(Name::ACTIVE),
            Some(name) if name == Name::ANY => None,
            Some(name) => Some(name),
        })
    }

    /// `updateauth` must be declared by the account with authority over the permission being
    /// updated, or over its parent when the permission is new.
    pub fn check_updateauth_authorization(
        &self,
        update: &UpdateAuth,
        auths: &[PermissionLevel],
    ) -> Result<(), AuthorizationError> {
        let auth = single_authorization(&Name::UPDATEAUTH, auths)?;
        require_actor(&Name::UPDATEAUTH, auth, &update.account)?;
        if update.permission == Name::ANY {
            return Err(AuthorizationError::ActionValidate(format!(
                "cannot create or update permission {}",
                Name::ANY
            )));
        }
        update.auth.validate()?;

        let updated = PermissionLevel::new(update.account.clone(), update.permission.clone());
        let min_permission = match self.store.find_permission(&updated) {
            Some(existing) => existing,
            None => self.get_permission(&PermissionLevel {
                actor: update.account.clone(),
                permission: update.parent.clone(),
            })?,
        };
        self.require_satisfies(&Name::UPDATEAUTH, auth, &min_permission)
    }

    /// `deleteauth` must be declared by the account with authority over the deleted permission.
    pub fn check_deleteauth_authorization(
        &self,
        delete: &DeleteAuth,
        auths: &[PermissionLevel],
    ) -> Result<(), AuthorizationError> {
        let auth = single_authorization(&Name::DELETEAUTH, auths)?;
        require_actor(&Name::DELETEAUTH, auth, &delete.account)?;
        let min_permission = self.get_permission(&PermissionLevel {
            actor: delete.account.clone(),
            permission: delete.permission.clone(),
        })?;
        self.require_satisfies(&Name::DELETEAUTH, auth, &min_permission)
    }

    /// `linkauth` must satisfy the permission currently required for the linked action. Native
    /// authorization actions can never be linked.
    pub fn check_linkauth_authorization(
        &self,
        link: &LinkAuth,
        auths: &[PermissionLevel],
    ) -> Result<(), AuthorizationError> {
        let auth = single_authorization(&Name::LINKAUTH, auths)?;
        require_actor(&Name::LINKAUTH, auth, &link.account)?;
        if is_native_authorization_action(&link.action_type) {
            return Err(AuthorizationError::ActionValidate(format!(
                "cannot link {}::{} to a minimum permission",
                Name::SYSTEM,
                link.action_type
            )));
        }

        let Some(linked) =
            self.lookup_minimum_permission(&link.account, &link.code, &link.action_type)?
        else {
            return Ok(());
        };
        let min_permission =
            self.get_permission(&PermissionLevel::new(link.account.clone(), linked))?;
        self.require_satisfies(&Name::LINKAUTH, auth, &min_permission)
    }

    /// `unlinkauth` must satisfy the permission of the link being removed, which must exist.
    pub fn check_unlinkauth_authorization(
        &self,
        unlink: &UnlinkAuth,
        auths: &[PermissionLevel],
    ) -> Result<(), AuthorizationError> {
        let auth = single_authorization(&Name::UNLINKAUTH, auths)?;
        require_actor(&Name::UNLINKAUTH, auth, &unlink.account)?;

        let unlinked = self
            .lookup_linked_permission(&unlink.account, &unlink.code, &unlink.action_type)
            .ok_or_else(|| {
                AuthorizationError::Transaction(format!(
                    "cannot unlink non-existent permission link of account '{}' for actions matching '{}::{}'",
                    unlink.account, unlink.code, unlink.action_type
                ))
            })?;
        if unlinked == Name::ANY {
            return Ok(());
        }
        let min_permission =
            self.get_permission(&PermissionLevel::new(unlink.account.clone(), unlinked))?;
        self.require_satisfies(&Name::UNLINKAUTH, auth, &min_permission)
    }

    /// `canceldelay` must satisfy the canceling authority, which in turn must be one of the
    /// delayed transaction's own declared authorizations.
    ///
    /// Returns the delay the cancelled transaction was scheduled with.
    pub fn check_canceldelay_authorization(
        &self,
        cancel: &CancelDelay,
        auths: &[PermissionLevel],
    ) -> Result<Duration, AuthorizationError> {
        let auth = single_authorization(&Name::CANCELDELAY, auths)?;
        let canceling = self.get_permission(&cancel.canceling_auth)?;
        if !self.get_permission(auth)?.satisfies(&canceling, &self.store) {
            return Err(AuthorizationError::IrrelevantAuthority {
                action: Name::CANCELDELAY,
                auth: auth.clone(),
                requirement: format!("specified authority to satisfy is {}", cancel.canceling_auth),
            });
        }

        let generated = self
            .store
            .find_generated_transaction(&cancel.trx_id)
            .filter(|generated| generated.sender.is_empty())
            .ok_or(AuthorizationError::TransactionNotFound(cancel.trx_id))?;

        let found = generated
            .transaction
            .actions
            .iter()
            .flat_map(|action| &action.authorization)
            .any(|declared| *declared == cancel.canceling_auth);
        if !found {
            return Err(AuthorizationError::ActionValidate(
                "canceling_auth in canceldelay action was not found as authorization in the original delayed transaction"
                    .to_string(),
            ));
        }

        Ok(Duration::from_micros(generated.delay_until.saturating_sub(generated.published)))
    }

    /// Check that `actions` are authorized by the provided keys, permissions and delay.
    ///
    /// Obligations are verified in ascending `(actor, permission)` order. `checktime` is called
    /// once per declared authorization, once per obligation, and once per authority the checker
    /// evaluates.
    pub fn check_authorization<C>(
        &self,
        actions: &[Action],
        provided_keys: impl IntoIterator<Item = PublicKey>,
        provided_permissions: impl IntoIterator<Item = PermissionLevel>,
        provided_delay: Duration,
        checktime: C,
        allow_unused_keys: bool,
    ) -> Result<(), AuthorizationError>
    where
        C: Fn() -> Result<(), AuthorizationError>,
    {
        let provided_keys: BTreeSet<_> = provided_keys.into_iter().collect();
        let provided_permissions: BTreeSet<_> = provided_permissions.into_iter().collect();
        let effective_delay = self.config.effective_delay(provided_delay);

        let mut checker = AuthorityChecker::new(
            self.resolver(),
            self.config.max_authority_depth,
            provided_keys.iter().copied(),
            provided_permissions.iter().cloned(),
            effective_delay,
            &checktime,
        );

        let mut permissions_to_satisfy = BTreeMap::<PermissionLevel, Duration>::new();
        for action in actions {
            if action.authorization.is_empty() {
                return Err(AuthorizationError::MissingAuth {
                    account: action.account.clone(),
                    action: action.name.clone(),
                });
            }

            let mut delay = effective_delay;
            let special_case = self.check_native_authorization(action, &mut delay)?;

            for declared in &action.authorization {
                checktime()?;
                if !special_case {
                    self.check_minimum_permission(action, declared)?;
                }
                permissions_to_satisfy
                    .entry(declared.clone())
                    .and_modify(|required| *required = (*required).min(delay))
                    .or_insert(delay);
            }
        }

        for (level, delay) in &permissions_to_satisfy {
            checktime()?;
            trace!(target: "quorum::authority", %level, ?delay, "checking obligation");
            if !checker.satisfied(level, *delay)? {
                debug!(target: "quorum::authority", %level, "unsatisfied authorization");
                return Err(AuthorizationError::UnsatisfiedAuthorization {
                    auth: level.clone(),
                    provided_delay_ms: delay.as_millis(),
                    provided_permissions: provided_permissions.into_iter().collect(),
                    provided_keys: provided_keys.into_iter().collect(),
                    delay_max_limit_ms: self.config.max_transaction_delay().as_millis(),
                });
            }
        }

        if !allow_unused_keys && !checker.all_keys_used() {
            return Err(AuthorizationError::TxIrrelevantSignature {
                keys: checker.unused_keys().into_iter().collect(),
            });
        }
        Ok(())
    }

    /// Check that the single permission `account@permission` is satisfied.
    pub fn check_permission_authorization<C>(
        &self,
        account: &Name,
        permission: &Name,
        provided_keys: impl IntoIterator<Item = PublicKey>,
        provided_permissions: impl IntoIterator<Item = PermissionLevel>,
        provided_delay: Duration,
        checktime: C,
        allow_unused_keys: bool,
    ) -> Result<(), AuthorizationError>
    where
        C: Fn() -> Result<(), AuthorizationError>,
    {
        let provided_keys: BTreeSet<_> = provided_keys.into_iter().collect();
        let provided_permissions: BTreeSet<_> = provided_permissions.into_iter().collect();
        let effective_delay = self.config.effective_delay(provided_delay);
        let level = PermissionLevel { actor: account.clone(), permission: permission.clone() };

        let mut checker = AuthorityChecker::new(
            self.resolver(),
            self.config.max_authority_depth,
            provided_keys.iter().copied(),
            provided_permissions.iter().cloned(),
            effective_delay,
            checktime,
        );
        if !checker.satisfied(&level, effective_delay)? {
            return Err(AuthorizationError::UnsatisfiedAuthorization {
                auth: level,
                provided_delay_ms: effective_delay.as_millis(),
                provided_permissions: provided_permissions.into_iter().collect(),
                provided_keys: provided_keys.into_iter().collect(),
                delay_max_limit_ms: self.config.max_transaction_delay().as_millis(),
            });
        }
        if !allow_unused_keys && !checker.all_keys_used() {
            return Err(AuthorizationError::TxIrrelevantSignature {
                keys: checker.unused_keys().into_iter().collect(),
            });
        }
        Ok(())
    }

    /// The subset of `candidate_keys` needed to authorize every declared authorization.
    pub fn get_required_keys(
        &self,
        actions: &[Action],
        candidate_keys: impl IntoIterator<Item = PublicKey>,
        provided_delay: Duration,
    ) -> Result<BTreeSet<PublicKey>, AuthorizationError> {
        let candidate_keys: Vec<_> = candidate_keys.into_iter().collect();
        let mut checker = AuthorityChecker::new(
            self.resolver(),
            self.config.max_authority_depth,
            candidate_keys.iter().copied(),
            Vec::<PermissionLevel>::new(),
            provided_delay,
            crate::noop_checktime,
        );
        for action in actions {
            for declared in &action.authorization {
                if !checker.satisfied(declared, provided_delay)? {
                    return Err(AuthorizationError::UnsatisfiedAuthorization {
                        auth: declared.clone(),
                        provided_delay_ms: provided_delay.as_millis(),
                        provided_permissions: Vec::new(),
                        provided_keys: candidate_keys,
                        delay_max_limit_ms: self.config.max_transaction_delay().as_millis(),
                    });
                }
            }
        }
        Ok(checker.used_keys())
    }

    /// Resolves a permission level to its current authority.
    fn resolver(&self) -> impl Fn(&PermissionLevel) -> Result<Authority, AuthorizationError> + '_ {
        move |level| self.get_permission(level).map(|permission| permission.auth)
    }

    /// Apply the bespoke rule of a native action. Returns false for every other action.
    fn check_native_authorization(
        &self,
        action: &Action,
        delay: &mut Duration,
    ) -> Result<bool, AuthorizationError> {
        if action.account != Name::SYSTEM || !is_native_authorization_action(&action.name) {
            return Ok(false);
        }
        let auths = &action.authorization;
        match &action.data {
            ActionData::UpdateAuth(update) if action.name == Name::UPDATEAUTH => {
                self.check_updateauth_authorization(update, auths)?
            }
            ActionData::DeleteAuth(delete) if action.name == Name::DELETEAUTH => {
                self.check_deleteauth_authorization(delete, auths)?
            }
            ActionData::LinkAuth(link) if action.name == Name::LINKAUTH => {
                self.check_linkauth_authorization(link, auths)?
            }
            ActionData::UnlinkAuth(unlink) if action.name == Name::UNLINKAUTH => {
                self.check_unlinkauth_authorization(unlink, auths)?
            }
            ActionData::CancelDelay(cancel) if action.name == Name::CANCELDELAY => {
                let scheduled = self.check_canceldelay_authorization(cancel, auths)?;
                *delay = (*delay).max(scheduled);
            }
            _ => {
                return Err(AuthorizationError::ActionValidate(format!(
                    "payload of {}::{} does not match the action",
                    action.account, action.name
                )))
            }
        }
        Ok(true)
    }

    /// A contract action may not be declared with more than its linked minimum permission.
    fn check_minimum_permission(
        &self,
        action: &Action,
        declared: &PermissionLevel,
    ) -> Result<(), AuthorizationError> {
        let Some(min_name) =
            self.lookup_minimum_permission(&declared.actor, &action.account, &action.name)?
        else {
            return Ok(());
        };
        let min_permission =
            self.get_permission(&PermissionLevel::new(declared.actor.clone(), min_name))?;
        self.require_satisfies(&action.name, declared, &min_permission)
    }

    fn require_satisfies(
        &self,
        action: &Name,
        auth: &PermissionLevel,
        min_permission: &Permission,
    ) -> Result<(), AuthorizationError> {
        if self.get_permission(auth)?.satisfies(min_permission, &self.store) {
            return Ok(());
        }
        Err(AuthorizationError::IrrelevantAuthority {
            action: action.clone(),
            auth: auth.clone(),
            requirement: format!("minimum authority is {}", min_permission.level()),
        })
    }
}

fn single_authorization<'a>(
    action: &Name,
    auths: &'a [PermissionLevel],
) -> Result<&'a PermissionLevel, AuthorizationError> {
    match auths {
        [auth] => Ok(auth),
        [] => {
            Err(AuthorizationError::MissingAuth { account: Name::SYSTEM, action: action.clone() })
        }
        [first, ..] => Err(AuthorizationError::IrrelevantAuthority {
            action: action.clone(),
            auth: first.clone(),
            requirement: "the action should only have one declared authorization".to_string(),
        }),
    }
}

fn require_actor(
    action: &Name,
    auth: &PermissionLevel,
    account: &Name,
) -> Result<(), AuthorizationError> {
    if auth.actor == *account {
        return Ok(());
    }
    Err(AuthorizationError::IrrelevantAuthority {
        action: action.clone(),
        auth: auth.clone(),
        requirement: format!(
            "the owner of the affected permission, {account}, needs to be the actor"
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{noop_checktime, test_utils::MemoryPermissionStore};
    use assert_matches::assert_matches;
    use quorum_primitives::PrivateKey;

    const NO_PERMISSIONS: [PermissionLevel; 0] = [];

    fn manager() -> (AuthorizationManager<MemoryPermissionStore>, PublicKey, PublicKey) {
        let owner_key = PrivateKey::from_seed(b"alice-owner").public_key();
        let active_key = PrivateKey::from_seed(b"alice-active").public_key();
        let mut store = MemoryPermissionStore::default();
        store.add_account("alice", Authority::from_key(owner_key), Authority::from_key(active_key));
        (AuthorizationManager::new(store, AuthorizationConfig::default()), owner_key, active_key)
    }

    #[test]
    fn test_minimum_permission_defaults_to_active() {
        let (manager, _, _) = manager();
        let alice = Name::new("alice");
        let token = Name::new("token");
        let transfer = Name::new("transfer");
        assert_eq!(
            manager.lookup_minimum_permission(&alice, &token, &transfer).unwrap(),
            Some(Name::ACTIVE)
        );
    }

    #[test]
    fn test_contract_wide_link_is_fallback() {
        let (mut manager, _, _) = manager();
        manager.store.add_permission("alice", "trade", "active", Authority::default());
        manager.store.link("alice", "token", "", "trade");
        manager.store.link("alice", "token", "burn", Name::ANY);

        let alice = Name::new("alice");
        let token = Name::new("token");
        assert_eq!(
            manager.lookup_minimum_permission(&alice, &token, &Name::new("transfer")).unwrap(),
            Some(Name::new("trade"))
        );
        assert_eq!(
            manager.lookup_minimum_permission(&alice, &token, &Name::new("burn")).unwrap(),
            None
        );
    }

    #[test]
    fn test_native_actions_have_no_minimum_permission() {
        let (manager, _, _) = manager();
        assert_matches!(
            manager.lookup_minimum_permission(
                &Name::new("alice"),
                &Name::SYSTEM,
                &Name::UPDATEAUTH
            ),
            Err(AuthorizationError::ActionValidate(_))
        );
    }

    #[test]
    fn test_single_declared_authorization() {
        let alice = PermissionLevel::new("alice", "active");
        assert_matches!(
            single_authorization(&Name::DELETEAUTH, &[]),
            Err(AuthorizationError::MissingAuth { .. })
        );
        assert_matches!(
            single_authorization(&Name::DELETEAUTH, &[alice.clone(), alice.clone()]),
            Err(AuthorizationError::IrrelevantAuthority { .. })
        );
        assert_eq!(single_authorization(&Name::DELETEAUTH, &[alice.clone()]).unwrap(), &alice);
    }

    #[test]
    fn test_unused_keys_rejected_unless_allowed() {
        let (manager, owner_key, active_key) = manager();
        let action =
            Action::new("token", "transfer", vec![PermissionLevel::new("alice", "active")]);

        assert_matches!(
            manager.check_authorization(
                &[action.clone()],
                [owner_key, active_key],
                NO_PERMISSIONS,
                Duration::ZERO,
                noop_checktime,
                false,
            ),
            Err(AuthorizationError::TxIrrelevantSignature { keys }) if keys == vec![owner_key]
        );
        manager
            .check_authorization(
                &[action],
                [owner_key, active_key],
                NO_PERMISSIONS,
                Duration::ZERO,
                noop_checktime,
                true,
            )
            .unwrap();
    }

    #[test]
    fn test_required_keys() {
        let (manager, owner_key, active_key) = manager();
        let action =
            Action::new("token", "transfer", vec![PermissionLevel::new("alice", "active")]);
        let required =
            manager.get_required_keys(&[action], [owner_key, active_key], Duration::ZERO).unwrap();
        assert_eq!(required, BTreeSet::from([active_key]));
    }

    #[test]
    fn test_single_permission_check() {
        let (manager, owner_key, active_key) = manager();
        let alice = Name::new("alice");
        manager
            .check_permission_authorization(
                &alice,
                &Name::OWNER,
                [owner_key],
                NO_PERMISSIONS,
                Duration::ZERO,
                noop_checktime,
                false,
            )
            .unwrap();
        assert_matches!(
            manager.check_permission_authorization(
                &alice,
                &Name::OWNER,
                [active_key],
                NO_PERMISSIONS,
                Duration::ZERO,
                noop_checktime,
                false,
            ),
            Err(AuthorizationError::UnsatisfiedAuthorization { .. })
        );
    }
}
