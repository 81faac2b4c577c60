//! Weighted-threshold satisfaction of authorities
//!
//! The checker answers whether a set of provided keys, pre-satisfied permission levels and a
//! provided delay reach the threshold of an authority, recursing through delegated
//! permissions. Leaves are visited in a fixed order (waits, then keys, then accounts, each in
//! stored ascending order) and evaluation stops as soon as the threshold is reached, so the
//! boolean result and the set of consumed keys are identical on every node.

use crate::{Authority, AuthorizationError};
use quorum_primitives::{Name, PermissionLevel, PublicKey};
use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};
use tracing::trace;

/// Checktime callback that never interrupts.
pub fn noop_checktime() -> Result<(), AuthorizationError> {
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheStatus {
    BeingEvaluated,
    Satisfied,
    Unsatisfied,
}

type PermissionCache = BTreeMap<PermissionLevel, CacheStatus>;

/// Checks authorities against provided keys, permissions and delay.
///
/// Created per transaction. `R` resolves a permission level to its current authority; `C` is
/// the cooperative cancellation point, called before every authority evaluation. Errors from
/// either are propagated untouched.
pub struct AuthorityChecker<R, C> {
    resolver: R,
    checktime: C,
    recursion_depth_limit: u16,
    provided_keys: Vec<PublicKey>,
    used_keys: Vec<bool>,
    provided_permissions: BTreeSet<PermissionLevel>,
    provided_delay: Duration,
}

impl<R, C> std::fmt::Debug for AuthorityChecker<R, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityChecker")
            .field("recursion_depth_limit", &self.recursion_depth_limit)
            .field("provided_keys", &self.provided_keys)
            .field("used_keys", &self.used_keys)
            .field("provided_permissions", &self.provided_permissions)
            .field("provided_delay", &self.provided_delay)
            .finish_non_exhaustive()
    }
}

impl<R, C> AuthorityChecker<R, C>
where
    R: Fn(&PermissionLevel) -> Result<Authority, AuthorizationError>,
    C: Fn() -> Result<(), AuthorizationError>,
{
    /// Create a checker.
    pub fn new(
        resolver: R,
        recursion_depth_limit: u16,
        provided_keys: impl IntoIterator<Item = PublicKey>,
        provided_permissions: impl IntoIterator<Item = PermissionLevel>,
        provided_delay: Duration,
        checktime: C,
    ) -> Self {
        let provided_keys: Vec<_> =
            provided_keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let used_keys = vec![false; provided_keys.len()];
        Self {
            resolver,
            checktime,
            recursion_depth_limit,
            provided_keys,
            used_keys,
            provided_permissions: provided_permissions.into_iter().collect(),
            provided_delay,
        }
    }

    /// Delay the checker was created with.
    pub const fn provided_delay(&self) -> Duration {
        self.provided_delay
    }

    /// Is `level` satisfied under `provided_delay`?
    ///
    /// Fails if `level` itself cannot be resolved. Delegations to missing permissions deeper in
    /// the tree just contribute no weight.
    pub fn satisfied(
        &mut self,
        level: &PermissionLevel,
        provided_delay: Duration,
    ) -> Result<bool, AuthorizationError> {
        let saved_delay = std::mem::replace(&mut self.provided_delay, provided_delay);
        let mut cache = self.initial_cache();
        let result = self.top_level_satisfied(level, &mut cache);
        self.provided_delay = saved_delay;
        result
    }

    /// Is `authority` satisfied under `provided_delay`?
    pub fn satisfied_authority(
        &mut self,
        authority: &Authority,
        provided_delay: Duration,
    ) -> Result<bool, AuthorizationError> {
        authority.validate()?;
        let saved_delay = std::mem::replace(&mut self.provided_delay, provided_delay);
        let mut cache = self.initial_cache();
        let result = self.authority_satisfied(authority, &mut cache, 0);
        self.provided_delay = saved_delay;
        result
    }

    /// True once every provided key contributed to a successful satisfaction.
    pub fn all_keys_used(&self) -> bool {
        self.used_keys.iter().all(|used| *used)
    }

    /// Provided keys consumed by successful satisfactions, ascending.
    pub fn used_keys(&self) -> BTreeSet<PublicKey> {
        self.partition_keys(true)
    }

    /// Provided keys never consumed, ascending.
    pub fn unused_keys(&self) -> BTreeSet<PublicKey> {
        self.partition_keys(false)
    }

    fn partition_keys(&self, used: bool) -> BTreeSet<PublicKey> {
        self.provided_keys
            .iter()
            .zip(&self.used_keys)
            .filter(|(_, u)| **u == used)
            .map(|(key, _)| *key)
            .collect()
    }

    fn initial_cache(&self) -> PermissionCache {
        self.provided_permissions
            .iter()
            .map(|level| (level.clone(), CacheStatus::Satisfied))
            .collect()
    }

    fn top_level_satisfied(
        &mut self,
        level: &PermissionLevel,
        cache: &mut PermissionCache,
    ) -> Result<bool, AuthorizationError> {
        if let Some(status) = cached_status(cache, level) {
            return Ok(status == CacheStatus::Satisfied);
        }
        if self.recursion_depth_limit == 0 {
            return Ok(false);
        }
        let authority = (self.resolver)(level)?;
        authority.validate()?;
        self.evaluate_permission(level, &authority, cache, 0)
    }

    /// Weight search over one authority at `depth`.
    fn authority_satisfied(
        &mut self,
        authority: &Authority,
        cache: &mut PermissionCache,
        depth: u16,
    ) -> Result<bool, AuthorizationError> {
        (self.checktime)()?;

        // keys consumed by a failed branch were not actually used
        let saved_keys = self.used_keys.clone();
        let threshold = authority.threshold;
        let mut total: u32 = 0;

        for wait in &authority.waits {
            if self.provided_delay >= Duration::from_secs(u64::from(wait.wait_sec)) {
                total = total.saturating_add(u32::from(wait.weight));
                if total >= threshold {
                    return Ok(true);
                }
            }
        }

        for key in &authority.keys {
            if let Ok(index) = self.provided_keys.binary_search(&key.key) {
                self.used_keys[index] = true;
                total = total.saturating_add(u32::from(key.weight));
                if total >= threshold {
                    return Ok(true);
                }
            }
        }

        for account in &authority.accounts {
            if self.delegation_satisfied(&account.permission, cache, depth)? {
                total = total.saturating_add(u32::from(account.weight));
                if total >= threshold {
                    return Ok(true);
                }
            }
        }

        self.used_keys = saved_keys;
        Ok(false)
    }

    /// A delegated permission leaf inside an authority evaluated at `depth`.
    fn delegation_satisfied(
        &mut self,
        level: &PermissionLevel,
        cache: &mut PermissionCache,
        depth: u16,
    ) -> Result<bool, AuthorizationError> {
        if let Some(status) = cached_status(cache, level) {
            return Ok(status == CacheStatus::Satisfied);
        }
        if depth >= self.recursion_depth_limit {
            trace!(target: "quorum::authority", %level, depth, "recursion depth exhausted");
            return Ok(false);
        }
        let authority = match (self.resolver)(level) {
            Ok(authority) => authority,
            Err(AuthorizationError::PermissionQuery(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        authority.validate()?;
        self.evaluate_permission(level, &authority, cache, depth)
    }

    fn evaluate_permission(
        &mut self,
        level: &PermissionLevel,
        authority: &Authority,
        cache: &mut PermissionCache,
        depth: u16,
    ) -> Result<bool, AuthorizationError> {
        cache.insert(level.clone(), CacheStatus::BeingEvaluated);
        let satisfied = self.authority_satisfied(authority, cache, depth + 1)?;
        let status = if satisfied { CacheStatus::Satisfied } else { CacheStatus::Unsatisfied };
        cache.insert(level.clone(), status);
        Ok(satisfied)
    }
}

/// Exact level first, then the actor-wide wildcard.
fn cached_status(cache: &PermissionCache, level: &PermissionLevel) -> Option<CacheStatus> {
    cache.get(level).copied().or_else(|| {
        let wildcard = PermissionLevel { actor: level.actor.clone(), permission: Name::ANY };
        cache.get(&wildcard).copied()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyWeight, PermissionLevelWeight, WaitWeight};
    use quorum_primitives::PrivateKey;
    use std::{cell::Cell, collections::HashMap};

    fn keys(n: usize) -> Vec<PublicKey> {
        let mut keys: Vec<_> =
            (0..n).map(|i| PrivateKey::from_seed(&[b'k', i as u8]).public_key()).collect();
        keys.sort();
        keys
    }

    fn key_authority(threshold: u32, keys: &[PublicKey]) -> Authority {
        Authority::new(
            threshold,
            keys.iter().map(|k| KeyWeight { key: *k, weight: 1 }).collect(),
            vec![],
            vec![],
        )
    }

    const NO_KEYS: [PublicKey; 0] = [];
    const NO_PERMISSIONS: [PermissionLevel; 0] = [];

    type Resolver = Box<dyn Fn(&PermissionLevel) -> Result<Authority, AuthorizationError>>;

    fn resolver(map: HashMap<PermissionLevel, Authority>) -> Resolver {
        Box::new(move |level| {
            map.get(level)
                .cloned()
                .ok_or_else(|| AuthorizationError::PermissionQuery(level.clone()))
        })
    }

    fn checker(
        map: HashMap<PermissionLevel, Authority>,
        provided: &[PublicKey],
    ) -> AuthorityChecker<Resolver, fn() -> Result<(), AuthorizationError>> {
        AuthorityChecker::new(
            resolver(map),
            6,
            provided.iter().copied(),
            NO_PERMISSIONS,
            Duration::ZERO,
            noop_checktime as fn() -> Result<(), AuthorizationError>,
        )
    }

    #[test]
    fn test_two_of_two_keys() {
        let k = keys(3);
        let auth = key_authority(2, &k[..2]);

        let mut both = checker(HashMap::new(), &[k[0], k[1]]);
        assert!(both.satisfied_authority(&auth, Duration::ZERO).unwrap());
        assert!(both.all_keys_used());

        let mut with_stranger = checker(HashMap::new(), &[k[0], k[2]]);
        assert!(!with_stranger.satisfied_authority(&auth, Duration::ZERO).unwrap());
        assert!(with_stranger.used_keys().is_empty());
        assert_eq!(with_stranger.unused_keys().len(), 2);
    }

    #[test]
    fn test_stops_at_threshold() {
        let k = keys(2);
        let auth = key_authority(1, &k);
        let mut checker = checker(HashMap::new(), &k);
        assert!(checker.satisfied_authority(&auth, Duration::ZERO).unwrap());
        // second key is never touched
        assert_eq!(checker.used_keys(), BTreeSet::from([k[0]]));
        assert!(!checker.all_keys_used());
    }

    #[test]
    fn test_wait_is_visited_before_keys() {
        let k = keys(1);
        let auth = Authority::new(
            1,
            vec![KeyWeight { key: k[0], weight: 1 }],
            vec![],
            vec![WaitWeight { wait_sec: 60, weight: 1 }],
        );
        let mut checker = checker(HashMap::new(), &k);
        assert!(checker.satisfied_authority(&auth, Duration::from_secs(60)).unwrap());
        assert!(checker.used_keys().is_empty());

        assert!(checker.satisfied_authority(&auth, Duration::from_secs(59)).unwrap());
        assert_eq!(checker.used_keys(), BTreeSet::from([k[0]]));
    }

    #[test]
    fn test_nested_delegation() {
        let k = keys(1);
        let x = PermissionLevel::new("x", "active");
        let y = PermissionLevel::new("y", "active");
        let map = HashMap::from([
            (x.clone(), Authority::from_permission(y.clone())),
            (y, key_authority(1, &k)),
        ]);
        let mut checker = checker(map, &k);
        assert!(checker.satisfied(&x, Duration::ZERO).unwrap());
        assert!(checker.all_keys_used());
    }

    #[test]
    fn test_depth_limit_fails_branch() {
        let k = keys(1);
        // chain of delegations a0 -> a1 -> ... -> a7 -> key
        let levels: Vec<_> =
            (0..8).map(|i| PermissionLevel::new(Name::new(format!("a{i}")), "active")).collect();
        let mut map = HashMap::new();
        for pair in levels.windows(2) {
            map.insert(pair[0].clone(), Authority::from_permission(pair[1].clone()));
        }
        map.insert(levels[7].clone(), key_authority(1, &k));

        let mut shallow = checker(map.clone(), &k);
        assert!(!shallow.satisfied(&levels[0], Duration::ZERO).unwrap());
        assert!(shallow.used_keys().is_empty());

        // starting deeper in the chain fits in the limit
        let mut deep_enough = checker(map, &k);
        assert!(deep_enough.satisfied(&levels[2], Duration::ZERO).unwrap());
    }

    #[test]
    fn test_delegation_cycle_is_unsatisfied() {
        let a = PermissionLevel::new("a", "active");
        let b = PermissionLevel::new("b", "active");
        let map = HashMap::from([
            (a.clone(), Authority::from_permission(b.clone())),
            (b, Authority::from_permission(a.clone())),
        ]);
        let mut checker = checker(map, &[]);
        assert!(!checker.satisfied(&a, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_missing_nested_permission_contributes_nothing() {
        let k = keys(1);
        let top = PermissionLevel::new("top", "active");
        let auth = Authority::new(
            1,
            vec![KeyWeight { key: k[0], weight: 1 }],
            vec![PermissionLevelWeight {
                permission: PermissionLevel::new("ghost", "active"),
                weight: 1,
            }],
            vec![],
        );
        let mut checker = checker(HashMap::from([(top.clone(), auth)]), &[]);
        assert!(!checker.satisfied(&top, Duration::ZERO).unwrap());

        let err = checker.satisfied(&PermissionLevel::new("ghost", "active"), Duration::ZERO);
        assert!(matches!(err, Err(AuthorizationError::PermissionQuery(_))));
    }

    #[test]
    fn test_provided_permissions_and_wildcard() {
        let x = PermissionLevel::new("x", "active");
        let map = HashMap::from([(
            x.clone(),
            Authority::from_permission(PermissionLevel::new("y", "custom")),
        )]);

        let mut exact = AuthorityChecker::new(
            resolver(map.clone()),
            6,
            NO_KEYS,
            [PermissionLevel::new("y", "custom")],
            Duration::ZERO,
            noop_checktime,
        );
        assert!(exact.satisfied(&x, Duration::ZERO).unwrap());

        let mut wildcard = AuthorityChecker::new(
            resolver(map),
            6,
            NO_KEYS,
            [PermissionLevel::new("y", Name::ANY)],
            Duration::ZERO,
            noop_checktime,
        );
        assert!(wildcard.satisfied(&x, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_checktime_error_propagates() {
        let k = keys(1);
        let calls = Cell::new(0);
        let mut checker = AuthorityChecker::new(
            resolver(HashMap::new()),
            6,
            k.clone(),
            NO_PERMISSIONS,
            Duration::ZERO,
            || {
                calls.set(calls.get() + 1);
                Err(AuthorizationError::Deadline)
            },
        );
        let result = checker.satisfied_authority(&key_authority(1, &k), Duration::ZERO);
        assert!(matches!(result, Err(AuthorizationError::Deadline)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_invalid_authority_rejected() {
        let k = keys(2);
        let unsorted = Authority::new(
            1,
            vec![KeyWeight { key: k[1], weight: 1 }, KeyWeight { key: k[0], weight: 1 }],
            vec![],
            vec![],
        );
        let mut checker = checker(HashMap::new(), &k);
        assert!(matches!(
            checker.satisfied_authority(&unsorted, Duration::ZERO),
            Err(AuthorizationError::InvalidAuthority(_))
        ));
    }
}
