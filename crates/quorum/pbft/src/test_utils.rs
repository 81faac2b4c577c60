//! In-memory chain for tests and simulations

use crate::{BlockInfo, BlockNum, PbftChain, ProducerKey, ProducerSchedule};
use alloy_primitives::B256;
use parking_lot::RwLock;
use quorum_primitives::{DigestEncoder, PrivateKey};
use std::{collections::HashMap, sync::Arc};

/// Deterministic producer keys `producer-0 .. producer-{n-1}`
pub fn producer_keys(n: usize) -> Vec<PrivateKey> {
    (0..n).map(|i| PrivateKey::from_seed(format!("producer-{i}").as_bytes())).collect()
}

/// A schedule with one producer per key, in key order
pub fn schedule_for(version: u32, keys: &[PrivateKey]) -> ProducerSchedule {
    let producers = keys
        .iter()
        .enumerate()
        .map(|(i, key)| ProducerKey::new(format!("producer{i}"), key.public_key()))
        .collect();
    ProducerSchedule::new(version, producers)
}

#[derive(Debug)]
struct BlockStore {
    blocks: HashMap<B256, BlockInfo>,
    /// Canonical chain, index `num - 1`
    canonical: Vec<B256>,
    head: BlockInfo,
    watermarks: Vec<BlockNum>,
}

/// Blocks shared between replicas, irreversibility tracked per replica.
///
/// Block ids are digests of `(parent, num)`; side-fork blocks also mix in a salt.
#[derive(Debug, Clone)]
pub struct MemoryChain {
    chain_id: B256,
    store: Arc<RwLock<BlockStore>>,
    lib: (BlockNum, B256),
    lscb: (BlockNum, B256),
    pending_lib: Option<B256>,
    async_lib: bool,
}

impl MemoryChain {
    /// A chain holding only a genesis block at height 1
    pub fn new(chain_id: B256, schedule: ProducerSchedule) -> Self {
        let genesis = BlockInfo {
            id: DigestEncoder::new().hash(&chain_id).u32(1).finish(),
            num: 1,
            previous: B256::ZERO,
            active_schedule: Arc::new(schedule),
        };
        let store = BlockStore {
            blocks: HashMap::from([(genesis.id, genesis.clone())]),
            canonical: vec![genesis.id],
            head: genesis,
            watermarks: Vec::new(),
        };
        Self {
            chain_id,
            store: Arc::new(RwLock::new(store)),
            lib: (0, B256::ZERO),
            lscb: (0, B256::ZERO),
            pending_lib: None,
            async_lib: false,
        }
    }

    /// A test chain scheduled with `keys`
    pub fn with_producers(keys: &[PrivateKey]) -> Self {
        Self::new(B256::repeat_byte(0x01), schedule_for(0, keys))
    }

    /// Another node's view of the same blocks, with its own irreversibility state
    pub fn replica(&self) -> Self {
        Self {
            chain_id: self.chain_id,
            store: Arc::clone(&self.store),
            lib: (0, B256::ZERO),
            lscb: (0, B256::ZERO),
            pending_lib: None,
            async_lib: self.async_lib,
        }
    }

    /// Extend the canonical chain. A new schedule takes effect at the new block and makes its
    /// parent a watermark.
    pub fn push_block(&mut self, schedule: Option<ProducerSchedule>) -> BlockInfo {
        let mut store = self.store.write();
        let parent = store.head.clone();
        let num = parent.num + 1;
        let active_schedule = match schedule {
            Some(schedule) => {
                store.watermarks.push(parent.num);
                Arc::new(schedule)
            }
            None => Arc::clone(&parent.active_schedule),
        };
        let block = BlockInfo {
            id: DigestEncoder::new().hash(&parent.id).u32(num).finish(),
            num,
            previous: parent.id,
            active_schedule,
        };
        store.blocks.insert(block.id, block.clone());
        store.canonical.push(block.id);
        store.head = block.clone();
        block
    }

    /// Extend the canonical chain by `count` blocks under the current schedule
    pub fn produce_blocks(&mut self, count: usize) {
        for _ in 0..count {
            self.push_block(None);
        }
    }

    /// Extend the canonical chain with a block switching to a new schedule of `keys`
    pub fn change_schedule(&mut self, keys: &[PrivateKey]) -> BlockInfo {
        let version = self.head_block().active_schedule.version + 1;
        self.push_block(Some(schedule_for(version, keys)))
    }

    /// Add a block on `parent` outside the canonical chain.
    ///
    /// # Panics
    ///
    /// If `parent` is unknown.
    pub fn push_fork_block(&mut self, parent: &B256) -> BlockInfo {
        let mut store = self.store.write();
        let parent = store.blocks.get(parent).cloned().expect("unknown fork parent");
        let num = parent.num + 1;
        let salt = store.blocks.len() as u32;
        let block = BlockInfo {
            id: DigestEncoder::new().hash(&parent.id).u32(num).u32(salt).finish(),
            num,
            previous: parent.id,
            active_schedule: Arc::clone(&parent.active_schedule),
        };
        store.blocks.insert(block.id, block.clone());
        block
    }

    /// Defer [`PbftChain::pbft_commit_local`] until [`Self::apply_pending_lib`]
    pub fn set_async_lib(&mut self, async_lib: bool) {
        self.async_lib = async_lib;
    }

    /// Apply a deferred LIB advance
    pub fn apply_pending_lib(&mut self) {
        if let Some(id) = self.pending_lib.take() {
            self.advance_lib(id);
        }
    }

    fn advance_lib(&mut self, id: B256) {
        let Some(block) = self.fetch_block_by_id(&id) else { return };
        if block.num > self.lib.0 {
            self.lib = (block.num, block.id);
        }
    }
}

impl PbftChain for MemoryChain {
    fn chain_id(&self) -> B256 {
        self.chain_id
    }

    fn head_block(&self) -> BlockInfo {
        self.store.read().head.clone()
    }

    fn fetch_block_by_id(&self, id: &B256) -> Option<BlockInfo> {
        self.store.read().blocks.get(id).cloned()
    }

    fn fetch_block_by_num(&self, num: BlockNum) -> Option<BlockInfo> {
        let store = self.store.read();
        let index = (num as usize).checked_sub(1)?;
        store.canonical.get(index).and_then(|id| store.blocks.get(id)).cloned()
    }

    fn last_irreversible_block_num(&self) -> BlockNum {
        self.lib.0
    }

    fn last_irreversible_block_id(&self) -> B256 {
        self.lib.1
    }

    fn last_stable_checkpoint_block_num(&self) -> BlockNum {
        self.lscb.0
    }

    fn last_stable_checkpoint_block_id(&self) -> B256 {
        self.lscb.1
    }

    fn set_stable_checkpoint(&mut self, id: B256) {
        if let Some(block) = self.fetch_block_by_id(&id) {
            self.lscb = (block.num, block.id);
        }
    }

    fn pbft_commit_local(&mut self, id: B256) {
        if self.async_lib {
            self.pending_lib = Some(id);
        } else {
            self.advance_lib(id);
        }
    }

    fn pending_pbft_lib(&self) -> bool {
        self.pending_lib.is_some()
    }

    fn pbft_watermarks(&self) -> Vec<BlockNum> {
        self.store.read().watermarks.clone()
    }
}
