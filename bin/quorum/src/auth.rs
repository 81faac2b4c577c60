//! Authorization scenarios
//!
//! Checks a handful of fixed scenarios against the authority checker and the authorization
//! manager and reports each outcome. Fails if any outcome differs from the expected one.

use clap::Parser;
use quorum_authority::{
    noop_checktime, test_utils::MemoryPermissionStore, Action, ActionData, Authority,
    AuthorityChecker, AuthorizationConfig, AuthorizationError, AuthorizationManager, KeyWeight,
    LinkAuth, PermissionLevelWeight,
};
use quorum_primitives::{Name, PermissionLevel, PrivateKey, PublicKey};
use std::time::Duration;
use tracing::{error, info};

const NO_PERMISSIONS: [PermissionLevel; 0] = [];

/// Authorization scenario arguments
#[derive(Debug, Parser)]
pub struct AuthArgs {
    /// Maximum delegation depth
    #[arg(long, default_value = "6")]
    pub max_authority_depth: u16,
}

impl AuthArgs {
    /// Run every scenario
    pub fn run(&self) -> eyre::Result<()> {
        let scenarios: [(&str, fn(&Self) -> Result<bool, AuthorizationError>); 4] = [
            ("two of two keys", Self::threshold_keys),
            ("nested delegation", Self::nested_delegation),
            ("native action lockout", Self::native_lockout),
            ("over-authorization", Self::over_authorization),
        ];

        let mut failed = 0;
        for (name, scenario) in scenarios {
            match scenario(self) {
                Ok(true) => info!(target: "quorum::sim", scenario = name, "passed"),
                Ok(false) => {
                    failed += 1;
                    error!(target: "quorum::sim", scenario = name, "unexpected outcome");
                }
                Err(err) => {
                    failed += 1;
                    error!(target: "quorum::sim", scenario = name, %err, "scenario errored");
                }
            }
        }
        eyre::ensure!(failed == 0, "{failed} authorization scenarios failed");
        Ok(())
    }

    fn checker<R>(
        &self,
        resolver: R,
        keys: impl IntoIterator<Item = PublicKey>,
    ) -> AuthorityChecker<R, fn() -> Result<(), AuthorizationError>>
    where
        R: Fn(&PermissionLevel) -> Result<Authority, AuthorizationError>,
    {
        AuthorityChecker::new(
            resolver,
            self.max_authority_depth,
            keys,
            NO_PERMISSIONS,
            Duration::ZERO,
            noop_checktime as fn() -> Result<(), AuthorizationError>,
        )
    }

    /// `threshold = 2` over keys A and B: `{A, B}` satisfies using both, `{A, C}` uses none
    fn threshold_keys(&self) -> Result<bool, AuthorizationError> {
        let [a, b, c] = [b"a", b"b", b"c"].map(|seed| PrivateKey::from_seed(seed).public_key());
        let mut keys = vec![KeyWeight { key: a, weight: 1 }, KeyWeight { key: b, weight: 1 }];
        keys.sort_by_key(|k| k.key);
        let authority = Authority::new(2, keys, Vec::new(), Vec::new());

        let mut checker = self.checker(unresolvable, [a, b]);
        let both =
            checker.satisfied_authority(&authority, Duration::ZERO)? && checker.all_keys_used();

        let mut checker = self.checker(unresolvable, [a, c]);
        let partial = !checker.satisfied_authority(&authority, Duration::ZERO)? &&
            checker.used_keys().is_empty();

        info!(target: "quorum::sim", both, partial, "threshold keys");
        Ok(both && partial)
    }

    /// X delegates to `y@active`, which resolves to key C
    fn nested_delegation(&self) -> Result<bool, AuthorizationError> {
        let c = PrivateKey::from_seed(b"c").public_key();
        let y_active = PermissionLevel::new("y", Name::ACTIVE);
        let x = Authority::new(
            1,
            Vec::new(),
            vec![PermissionLevelWeight { permission: y_active.clone(), weight: 1 }],
            Vec::new(),
        );

        let resolver = move |level: &PermissionLevel| {
            if *level == y_active {
                Ok(Authority::from_key(c))
            } else {
                Err(AuthorizationError::PermissionQuery(level.clone()))
            }
        };
        let mut checker = self.checker(resolver, [c]);
        let satisfied = checker.satisfied_authority(&x, Duration::ZERO)?;
        Ok(satisfied && checker.all_keys_used())
    }

    /// Linking `updateauth` to a minimum permission fails validation
    fn native_lockout(&self) -> Result<bool, AuthorizationError> {
        let (manager, owner, active) = self.manager();
        let link = Action::native(
            ActionData::LinkAuth(LinkAuth {
                account: Name::new("alice"),
                code: Name::SYSTEM,
                action_type: Name::UPDATEAUTH,
                requirement: Name::ACTIVE,
            }),
            vec![PermissionLevel::new("alice", Name::OWNER)],
        );
        let result = manager.check_authorization(
            &[link],
            [owner, active],
            NO_PERMISSIONS,
            Duration::ZERO,
            noop_checktime,
            true,
        );
        info!(target: "quorum::sim", ?result, "linkauth to updateauth");
        Ok(matches!(result, Err(AuthorizationError::ActionValidate(_))))
    }

    /// Authorizing a plain action with `owner` when `active` suffices is rejected
    fn over_authorization(&self) -> Result<bool, AuthorizationError> {
        let (manager, owner, _) = self.manager();
        let transfer =
            Action::new("token", "transfer", vec![PermissionLevel::new("alice", Name::OWNER)]);
        let result = manager.check_authorization(
            &[transfer],
            [owner],
            NO_PERMISSIONS,
            Duration::ZERO,
            noop_checktime,
            false,
        );
        info!(target: "quorum::sim", ?result, "transfer authorized by owner");
        Ok(matches!(result, Err(AuthorizationError::IrrelevantAuthority { .. })))
    }

    fn manager(&self) -> (AuthorizationManager<MemoryPermissionStore>, PublicKey, PublicKey) {
        let owner = PrivateKey::from_seed(b"alice-owner").public_key();
        let active = PrivateKey::from_seed(b"alice-active").public_key();
        let mut store = MemoryPermissionStore::default();
        store.add_account("alice", Authority::from_key(owner), Authority::from_key(active));
        let config = AuthorizationConfig {
            max_authority_depth: self.max_authority_depth,
            ..Default::default()
        };
        (AuthorizationManager::new(store, config), owner, active)
    }
}

fn unresolvable(level: &PermissionLevel) -> Result<Authority, AuthorizationError> {
    Err(AuthorizationError::PermissionQuery(level.clone()))
}
