//! The chain the PBFT engine finalizes
//!
//! Block storage, fork choice and irreversibility bookkeeping belong to the chain controller.
//! The engine reads blocks through [`PbftChain`] and asks it to advance the last irreversible
//! block and the last stable checkpoint.

use crate::{BlockNum, ProducerSchedule};
use alloy_primitives::B256;
use quorum_primitives::PublicKey;
use std::sync::Arc;

/// What the engine needs to know about a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block id
    pub id: B256,
    /// Block height
    pub num: BlockNum,
    /// Parent block id
    pub previous: B256,
    /// Producers active for this block
    pub active_schedule: Arc<ProducerSchedule>,
}

/// Chain controller seam
pub trait PbftChain {
    /// Chain id all messages must carry
    fn chain_id(&self) -> B256;

    /// Current head block
    fn head_block(&self) -> BlockInfo;

    /// Look up a block on any known fork
    fn fetch_block_by_id(&self, id: &B256) -> Option<BlockInfo>;

    /// Look up a block on the current head's chain
    fn fetch_block_by_num(&self, num: BlockNum) -> Option<BlockInfo>;

    /// Last irreversible block height
    fn last_irreversible_block_num(&self) -> BlockNum;

    /// Last irreversible block id
    fn last_irreversible_block_id(&self) -> B256;

    /// Last stable checkpoint height
    fn last_stable_checkpoint_block_num(&self) -> BlockNum;

    /// Last stable checkpoint id
    fn last_stable_checkpoint_block_id(&self) -> B256;

    /// Record a new stable checkpoint
    fn set_stable_checkpoint(&mut self, id: B256);

    /// Request that `id` becomes irreversible. May take effect later.
    fn pbft_commit_local(&mut self, id: B256);

    /// True while a requested irreversibility advance has not been applied yet
    fn pending_pbft_lib(&self) -> bool;

    /// Heights of the last blocks produced under each pending schedule, ascending
    fn pbft_watermarks(&self) -> Vec<BlockNum>;

    /// Head block height
    fn head_block_num(&self) -> BlockNum {
        self.head_block().num
    }

    /// Producers active at the head block
    fn head_schedule(&self) -> Arc<ProducerSchedule> {
        self.head_block().active_schedule
    }

    /// Check if `key` is scheduled at the head block
    fn is_active_producer(&self, key: &PublicKey) -> bool {
        self.head_schedule().contains_key(key)
    }
}
