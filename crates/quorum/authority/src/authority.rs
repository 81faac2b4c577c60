//! Weighted-threshold authorities

use quorum_primitives::{PermissionLevel, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Weight contributed by a single leaf of an authority.
pub type Weight = u16;

/// A public key and the weight its signature contributes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyWeight {
    /// Signing key
    pub key: PublicKey,
    /// Weight added when the key is provided
    pub weight: Weight,
}

/// Delegation to another account's permission.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionLevelWeight {
    /// Delegated permission
    pub permission: PermissionLevel,
    /// Weight added when the delegated permission is satisfied
    pub weight: Weight,
}

/// A time lock: satisfied when the transaction is delayed by at least `wait_sec`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaitWeight {
    /// Required delay in seconds
    pub wait_sec: u32,
    /// Weight added when the delay is provided
    pub weight: Weight,
}

/// Reasons an authority is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidAuthority {
    /// Threshold of zero would be satisfied by nothing at all
    #[error("authority threshold must be at least 1")]
    ZeroThreshold,
    /// Every leaf must contribute
    #[error("authority contains a zero weight")]
    ZeroWeight,
    /// Keys out of order or duplicated
    #[error("authority keys are not strictly ascending")]
    UnsortedKeys,
    /// Accounts out of order or duplicated
    #[error("authority accounts are not strictly ascending")]
    UnsortedAccounts,
    /// Waits out of order or duplicated
    #[error("authority waits are not strictly ascending")]
    UnsortedWaits,
    /// Sum of weights cannot reach the threshold
    #[error("authority threshold {threshold} exceeds total weight {total}")]
    Unreachable {
        /// Declared threshold
        threshold: u32,
        /// Sum of all leaf weights
        total: u32,
    },
    /// Sum of weights overflowed
    #[error("authority weight sum overflows")]
    WeightOverflow,
}

/// A threshold over keys, delegated permissions and waits.
///
/// Each list is kept strictly ascending by its sort key. The checker walks the lists in that
/// stored order, so the order is part of consensus and never re-derived.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authority {
    /// Weight required to satisfy this authority
    pub threshold: u32,
    /// Keys, ascending by key bytes
    pub keys: Vec<KeyWeight>,
    /// Delegated permissions, ascending by permission level
    pub accounts: Vec<PermissionLevelWeight>,
    /// Waits, ascending by wait seconds
    pub waits: Vec<WaitWeight>,
}

impl Authority {
    /// Create an authority from its parts. The lists must already be sorted.
    pub fn new(
        threshold: u32,
        keys: Vec<KeyWeight>,
        accounts: Vec<PermissionLevelWeight>,
        waits: Vec<WaitWeight>,
    ) -> Self {
        Self { threshold, keys, accounts, waits }
    }

    /// Single-key authority with threshold 1.
    pub fn from_key(key: PublicKey) -> Self {
        Self::new(1, vec![KeyWeight { key, weight: 1 }], Vec::new(), Vec::new())
    }

    /// Single-delegation authority with threshold 1.
    pub fn from_permission(permission: PermissionLevel) -> Self {
        Self::new(1, Vec::new(), vec![PermissionLevelWeight { permission, weight: 1 }], Vec::new())
    }

    /// Total weight of all leaves, or `None` on overflow.
    pub fn total_weight(&self) -> Option<u32> {
        let keys = self.keys.iter().map(|k| k.weight);
        let accounts = self.accounts.iter().map(|a| a.weight);
        let waits = self.waits.iter().map(|w| w.weight);
        keys.chain(accounts)
            .chain(waits)
            .try_fold(0u32, |acc, weight| acc.checked_add(u32::from(weight)))
    }

    /// Check the structural invariants.
    pub fn validate(&self) -> Result<(), InvalidAuthority> {
        if self.threshold == 0 {
            return Err(InvalidAuthority::ZeroThreshold);
        }
        let zero_weight = self.keys.iter().any(|k| k.weight == 0) ||
            self.accounts.iter().any(|a| a.weight == 0) ||
            self.waits.iter().any(|w| w.weight == 0);
        if zero_weight {
            return Err(InvalidAuthority::ZeroWeight);
        }
        if !self.keys.windows(2).all(|w| w[0].key < w[1].key) {
            return Err(InvalidAuthority::UnsortedKeys);
        }
        if !self.accounts.windows(2).all(|w| w[0].permission < w[1].permission) {
            return Err(InvalidAuthority::UnsortedAccounts);
        }
        if !self.waits.windows(2).all(|w| w[0].wait_sec < w[1].wait_sec) {
            return Err(InvalidAuthority::UnsortedWaits);
        }
        let total = self.total_weight().ok_or(InvalidAuthority::WeightOverflow)?;
        if total < self.threshold {
            return Err(InvalidAuthority::Unreachable { threshold: self.threshold, total });
        }
        Ok(())
    }

    /// Returns true if [`Self::validate`] passes.
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_primitives::PrivateKey;

    fn sorted_keys(n: usize) -> Vec<PublicKey> {
        let mut keys: Vec<_> =
            (0..n).map(|i| PrivateKey::from_seed(&[i as u8]).public_key()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_valid_authority() {
        let keys = sorted_keys(2);
        let auth = Authority::new(
            2,
            keys.iter().map(|k| KeyWeight { key: *k, weight: 1 }).collect(),
            vec![PermissionLevelWeight {
                permission: PermissionLevel::new("alice", "active"),
                weight: 1,
            }],
            vec![WaitWeight { wait_sec: 3600, weight: 1 }],
        );
        assert_eq!(auth.total_weight(), Some(4));
        assert!(auth.is_valid());
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let mut auth = Authority::from_key(sorted_keys(1)[0]);
        auth.threshold = 0;
        assert_eq!(auth.validate(), Err(InvalidAuthority::ZeroThreshold));
    }

    #[test]
    fn test_rejects_unreachable_threshold() {
        let mut auth = Authority::from_key(sorted_keys(1)[0]);
        auth.threshold = 2;
        assert_eq!(auth.validate(), Err(InvalidAuthority::Unreachable { threshold: 2, total: 1 }));
    }

    #[test]
    fn test_rejects_unsorted_and_duplicate_keys() {
        let keys = sorted_keys(2);
        let reversed = Authority::new(
            1,
            vec![KeyWeight { key: keys[1], weight: 1 }, KeyWeight { key: keys[0], weight: 1 }],
            vec![],
            vec![],
        );
        assert_eq!(reversed.validate(), Err(InvalidAuthority::UnsortedKeys));

        let duplicated = Authority::new(
            1,
            vec![KeyWeight { key: keys[0], weight: 1 }, KeyWeight { key: keys[0], weight: 1 }],
            vec![],
            vec![],
        );
        assert_eq!(duplicated.validate(), Err(InvalidAuthority::UnsortedKeys));
    }

    #[test]
    fn test_rejects_unsorted_accounts_and_waits() {
        let accounts = Authority::new(
            1,
            vec![],
            vec![
                PermissionLevelWeight {
                    permission: PermissionLevel::new("bob", "active"),
                    weight: 1,
                },
                PermissionLevelWeight {
                    permission: PermissionLevel::new("alice", "active"),
                    weight: 1,
                },
            ],
            vec![],
        );
        assert_eq!(accounts.validate(), Err(InvalidAuthority::UnsortedAccounts));

        let waits = Authority::new(
            1,
            vec![KeyWeight { key: sorted_keys(1)[0], weight: 1 }],
            vec![],
            vec![WaitWeight { wait_sec: 10, weight: 1 }, WaitWeight { wait_sec: 10, weight: 1 }],
        );
        assert_eq!(waits.validate(), Err(InvalidAuthority::UnsortedWaits));
    }

    #[test]
    fn test_rejects_zero_weight() {
        let mut auth = Authority::from_key(sorted_keys(1)[0]);
        auth.keys[0].weight = 0;
        assert_eq!(auth.validate(), Err(InvalidAuthority::ZeroWeight));
    }
}
