//! Producer schedules and quorum thresholds
//!
//! A schedule is the ordered list of block producers active for a block. Quorums are counted
//! over distinct signing keys present in the schedule, tolerating `f = (N - 1) / 3` faulty
//! producers out of `N`.

use quorum_primitives::{Name, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A producer in a schedule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerKey {
    /// Producer account
    pub producer_name: Name,
    /// Key the producer signs blocks and PBFT messages with
    pub block_signing_key: PublicKey,
}

impl ProducerKey {
    /// Create a producer entry
    pub fn new(producer_name: impl Into<Name>, block_signing_key: PublicKey) -> Self {
        Self { producer_name: producer_name.into(), block_signing_key }
    }
}

/// The active producer set of a block
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerSchedule {
    /// Schedule version, bumped on every change
    pub version: u32,
    /// Producers in round-robin order
    pub producers: Vec<ProducerKey>,
}

impl ProducerSchedule {
    /// Create a schedule
    pub fn new(version: u32, producers: Vec<ProducerKey>) -> Self {
        Self { version, producers }
    }

    /// Number of producers
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Check if the schedule is empty
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Check if `key` signs for a scheduled producer
    pub fn contains_key(&self, key: &PublicKey) -> bool {
        self.producers.iter().any(|p| p.block_signing_key == *key)
    }

    /// Maximum number of faulty producers tolerated: `(N - 1) / 3`
    pub fn fault_tolerance(&self) -> usize {
        self.len().saturating_sub(1) / 3
    }

    /// Strong quorum: `2f + 1`
    pub fn quorum(&self) -> usize {
        2 * self.fault_tolerance() + 1
    }

    /// Weak quorum, enough to prove one honest producer: `f + 1`
    pub fn weak_quorum(&self) -> usize {
        self.fault_tolerance() + 1
    }

    /// Number of distinct scheduled producers among `keys`
    pub fn count_signers<'a>(&self, keys: impl IntoIterator<Item = &'a PublicKey>) -> usize {
        keys.into_iter().filter(|key| self.contains_key(key)).collect::<BTreeSet<_>>().len()
    }

    /// Round-robin primary for `view`
    pub fn primary(&self, view: u32) -> Option<&ProducerKey> {
        if self.is_empty() {
            return None;
        }
        self.producers.get(view as usize % self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_primitives::PrivateKey;

    fn schedule(n: usize) -> ProducerSchedule {
        let producers = (0..n)
            .map(|i| {
                let key = PrivateKey::from_seed(&[b'b', b'p', i as u8]).public_key();
                ProducerKey::new(Name::new(format!("bp{i}")), key)
            })
            .collect();
        ProducerSchedule::new(1, producers)
    }

    #[test]
    fn test_quorum_thresholds() {
        let four = schedule(4);
        assert_eq!(four.fault_tolerance(), 1);
        assert_eq!(four.quorum(), 3);
        assert_eq!(four.weak_quorum(), 2);

        let twenty_one = schedule(21);
        assert_eq!(twenty_one.fault_tolerance(), 6);
        assert_eq!(twenty_one.quorum(), 13);
        assert_eq!(twenty_one.weak_quorum(), 7);

        let one = schedule(1);
        assert_eq!(one.quorum(), 1);
    }

    #[test]
    fn test_count_signers_ignores_duplicates_and_strangers() {
        let set = schedule(4);
        let stranger = PrivateKey::from_seed(b"stranger").public_key();
        let k0 = set.producers[0].block_signing_key;
        let k1 = set.producers[1].block_signing_key;
        assert_eq!(set.count_signers([&k0, &k0, &k1, &stranger]), 2);
    }

    #[test]
    fn test_primary_round_robin() {
        let set = schedule(4);
        assert_eq!(set.primary(0), Some(&set.producers[0]));
        assert_eq!(set.primary(5), Some(&set.producers[1]));
        assert!(ProducerSchedule::default().primary(3).is_none());
    }
}
