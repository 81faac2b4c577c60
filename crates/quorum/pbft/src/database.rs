//! PBFT quorum bookkeeping
//!
//! ```text
//!  prepares / commits ──► PbftState        per block id: votes + prepared/committed flags
//!  view changes       ──► PbftViewState    per target view: requests + view-changed flag
//!  checkpoints        ──► PbftCheckpointState  per block id: claims + stable flag
//! ```
//!
//! States live in arenas with id/view maps alongside; the prepared and committed flags are
//! mirrored in `(block_num, block_id)` ordered sets so the highest candidate is a single lookup.
//! A prepare or commit for a block also counts for every ancestor above the last irreversible
//! block, and quorums are counted per view over producers scheduled for that block.

use crate::{
    new_uuid, BlockInfo, BlockNum, PbftChain, PbftCheckpoint, PbftCommit, PbftError, PbftMessage,
    PbftNewView, PbftPrepare, PbftPreparedCertificate, PbftSignals, PbftStableCheckpoint,
    PbftViewChange, PbftViewChangedCertificate, ProducerSchedule, SignedMessage, Uuid, View,
};
use alloy_primitives::B256;
use quorum_primitives::{now_micros, PrivateKey, PublicKey};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
    sync::Arc,
};
use tracing::{debug, info, trace};

/// Votes collected for one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbftState {
    /// Block id
    pub block_id: B256,
    /// Block height
    pub block_num: BlockNum,
    /// Prepares for this block or a descendant
    pub prepares: Vec<PbftPrepare>,
    /// Prepare quorum reached in some view
    pub should_prepared: bool,
    /// Commits for this block or a descendant
    pub commits: Vec<PbftCommit>,
    /// Commit quorum reached in some view
    pub should_committed: bool,
}

/// View changes collected for one target view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbftViewState {
    /// Target view
    pub view: View,
    /// One view change per producer
    pub view_changes: Vec<PbftViewChange>,
    /// View-change quorum reached
    pub should_view_changed: bool,
}

/// Checkpoints collected for one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbftCheckpointState {
    /// Block id
    pub block_id: B256,
    /// Block height
    pub block_num: BlockNum,
    /// One checkpoint per producer
    pub checkpoints: Vec<PbftCheckpoint>,
    /// Checkpoint quorum reached
    pub is_stable: bool,
}

/// A `(block id, height)` pair referenced by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    /// Block id
    pub id: B256,
    /// Block height
    pub num: BlockNum,
}

/// PBFT message store and quorum queries over a [`PbftChain`]
#[derive(Debug)]
pub struct PbftDatabase<C> {
    chain: C,
    signer: Option<PrivateKey>,
    signals: PbftSignals,
    checkpoint_interval: u32,

    states: Vec<PbftState>,
    state_by_id: HashMap<B256, usize>,
    prepared_index: BTreeSet<(BlockNum, B256)>,
    committed_index: BTreeSet<(BlockNum, B256)>,

    view_states: Vec<PbftViewState>,
    view_by_num: BTreeMap<View, usize>,

    checkpoint_states: Vec<PbftCheckpointState>,
    checkpoint_by_id: HashMap<B256, usize>,

    /// Block this node last prepared; re-prepared while it still extends the LIB
    my_prepare: Option<B256>,
}

impl<C: PbftChain> PbftDatabase<C> {
    /// Create an empty database. Without a `signer` the node only observes.
    pub fn new(
        chain: C,
        signer: Option<PrivateKey>,
        signals: PbftSignals,
        checkpoint_interval: u32,
    ) -> Self {
        Self {
            chain,
            signer,
            signals,
            checkpoint_interval,
            states: Vec::new(),
            state_by_id: HashMap::new(),
            prepared_index: BTreeSet::new(),
            committed_index: BTreeSet::new(),
            view_states: Vec::new(),
            view_by_num: BTreeMap::new(),
            checkpoint_states: Vec::new(),
            checkpoint_by_id: HashMap::new(),
            my_prepare: None,
        }
    }

    /// The chain
    pub const fn chain(&self) -> &C {
        &self.chain
    }

    /// Mutable access to the chain
    pub fn chain_mut(&mut self) -> &mut C {
        &mut self.chain
    }

    /// Message signals
    pub const fn signals(&self) -> &PbftSignals {
        &self.signals
    }

    /// This node's signing key, if it has one
    pub fn public_key(&self) -> Option<PublicKey> {
        self.signer.as_ref().map(PrivateKey::public_key)
    }

    /// Votes recorded for `block_id`
    pub fn pbft_state(&self, block_id: &B256) -> Option<&PbftState> {
        self.state_by_id.get(block_id).map(|&index| &self.states[index])
    }

    /// View changes recorded for `view`
    pub fn view_state(&self, view: View) -> Option<&PbftViewState> {
        self.view_by_num.get(&view).map(|&index| &self.view_states[index])
    }

    /// Checkpoints recorded for `block_id`
    pub fn checkpoint_state(&self, block_id: &B256) -> Option<&PbftCheckpointState> {
        self.checkpoint_by_id.get(block_id).map(|&index| &self.checkpoint_states[index])
    }

    /// Producers of the last stable checkpoint block, falling back to the head's
    pub fn lscb_schedule(&self) -> Arc<ProducerSchedule> {
        self.chain
            .fetch_block_by_id(&self.chain.last_stable_checkpoint_block_id())
            .map(|block| block.active_schedule)
            .unwrap_or_else(|| self.chain.head_schedule())
    }

    /// Whether messages signed by `key` are accepted
    pub fn should_recv_pbft_msg(&self, key: &PublicKey) -> bool {
        self.lscb_schedule().contains_key(key) || self.chain.is_active_producer(key)
    }

    /// Whether this node is a scheduled producer that should send messages
    pub fn should_send_pbft_msg(&self) -> bool {
        self.public_key().is_some_and(|key| self.should_recv_pbft_msg(&key))
    }

    // --- prepares and commits ---

    /// Record a prepare for its block and every ancestor above the LIB.
    pub fn add_pbft_prepare(&mut self, prepare: PbftPrepare) {
        if !self.is_valid_prepare(&prepare) {
            debug!(
                target: "quorum::pbft::db",
                signer = %prepare.public_key,
                block_num = prepare.block_num,
                "dropping invalid prepare"
            );
            return;
        }
        let lib = self.chain.last_irreversible_block_num();
        let mut current = self.chain.fetch_block_by_id(&prepare.block_id);
        while let Some(block) = current.take().filter(|block| block.num > lib) {
            let index = self.state_index_or_insert(&block);
            let state = &mut self.states[index];
            let duplicate = state.prepares.iter().any(|p| {
                p.uuid == prepare.uuid ||
                    (p.public_key == prepare.public_key && p.view == prepare.view)
            });
            if !duplicate {
                state.prepares.push(prepare.clone());
            }
            let votes = state.prepares.iter().map(|p| (p.view, &p.public_key));
            let has_quorum = !quorum_views(votes, &block.active_schedule).is_empty();
            if !state.should_prepared && has_quorum {
                state.should_prepared = true;
                self.prepared_index.insert((block.num, block.id));
                debug!(
                    target: "quorum::pbft::db",
                    block_num = block.num,
                    block_id = %block.id,
                    "block prepared"
                );
            }
            current = self.chain.fetch_block_by_id(&block.previous);
        }
    }

    /// Record a commit for its block and every ancestor above the LIB.
    pub fn add_pbft_commit(&mut self, commit: PbftCommit) {
        if !self.is_valid_commit(&commit) {
            debug!(
                target: "quorum::pbft::db",
                signer = %commit.public_key,
                block_num = commit.block_num,
                "dropping invalid commit"
            );
            return;
        }
        let lib = self.chain.last_irreversible_block_num();
        let mut current = self.chain.fetch_block_by_id(&commit.block_id);
        while let Some(block) = current.take().filter(|block| block.num > lib) {
            let index = self.state_index_or_insert(&block);
            let state = &mut self.states[index];
            let duplicate = state.commits.iter().any(|c| {
                c.uuid == commit.uuid ||
                    (c.public_key == commit.public_key && c.view == commit.view)
            });
            if !duplicate {
                state.commits.push(commit.clone());
            }
            let votes = state.commits.iter().map(|c| (c.view, &c.public_key));
            let has_quorum = !quorum_views(votes, &block.active_schedule).is_empty();
            if !state.should_committed && has_quorum {
                state.should_committed = true;
                self.committed_index.insert((block.num, block.id));
                debug!(
                    target: "quorum::pbft::db",
                    block_num = block.num,
                    block_id = %block.id,
                    "block committed"
                );
            }
            current = self.chain.fetch_block_by_id(&block.previous);
        }
    }

    /// Highest prepared block above the LIB
    fn prepared_state(&self) -> Option<&PbftState> {
        let lib = self.chain.last_irreversible_block_num();
        self.prepared_index
            .last()
            .filter(|(num, _)| *num > lib)
            .and_then(|(_, id)| self.pbft_state(id))
    }

    /// Highest committed block above the LIB
    fn committed_state(&self) -> Option<&PbftState> {
        let lib = self.chain.last_irreversible_block_num();
        self.committed_index
            .last()
            .filter(|(num, _)| *num > lib)
            .and_then(|(_, id)| self.pbft_state(id))
    }

    /// A block above the LIB (and so above the last stable checkpoint) gathered a prepare
    /// quorum
    pub fn should_prepared(&self) -> bool {
        self.prepared_state().is_some()
    }

    /// A block above the LIB gathered a commit quorum
    pub fn should_committed(&self) -> bool {
        self.committed_state().is_some()
    }

    /// Highest view in which the highest committed block gathered its commit quorum, or 0
    ///
    /// Unlike [`Self::should_committed`] this also sees a block that already became irreversible.
    pub fn get_committed_view(&self) -> View {
        let Some(state) = self.committed_index.last().and_then(|(_, id)| self.pbft_state(id)) else {
            return 0;
        };
        let Some(block) = self.chain.fetch_block_by_id(&state.block_id) else { return 0 };
        quorum_views(state.commits.iter().map(|c| (c.view, &c.public_key)), &block.active_schedule)
            .last()
            .copied()
            .unwrap_or(0)
    }

    /// Ask the chain to make the highest committed block irreversible
    pub fn commit_local(&mut self) {
        let Some(state) = self.committed_state() else { return };
        let (id, num) = (state.block_id, state.block_num);
        info!(
            target: "quorum::pbft::db",
            block_num = num,
            block_id = %id,
            "committing block locally"
        );
        self.chain.pbft_commit_local(id);
    }

    /// Whether a requested LIB advance is still pending on the chain
    pub fn pending_pbft_lib(&self) -> bool {
        self.chain.pending_pbft_lib()
    }

    /// Lowest watermark above the LIB, or 0
    pub fn get_current_pbft_watermark(&self) -> BlockNum {
        let lib = self.chain.last_irreversible_block_num();
        self.chain.pbft_watermarks().into_iter().find(|w| *w > lib).unwrap_or(0)
    }

    /// Broadcast this node's prepare.
    ///
    /// A cached prepare is re-signed with a fresh uuid and re-sent. Otherwise the node keeps
    /// preparing its previous choice while it still extends the LIB, or prepares the head block
    /// capped at the current watermark. Returns the prepare to cache.
    pub fn send_and_add_pbft_prepare(
        &mut self,
        cached: Option<&PbftPrepare>,
        current_view: View,
    ) -> Option<PbftPrepare> {
        let signer = self.signer.clone()?;
        if let Some(cached) = cached {
            let mut prepare = cached.clone();
            refresh(&mut prepare.uuid, &mut prepare.timestamp);
            prepare.sign(&signer);
            self.signals.emit_outgoing(PbftMessage::Prepare(prepare.clone()));
            return Some(prepare);
        }

        let head = self.chain.head_block_num();
        if head <= 1 {
            return None;
        }

        let lib = self.chain.last_irreversible_block_num();
        let reserved = self
            .my_prepare
            .and_then(|id| self.chain.fetch_block_by_id(&id))
            .filter(|block| block.num > lib && self.extends_lib(block));
        let block = match reserved {
            Some(block) => block,
            None => {
                let watermark = self.get_current_pbft_watermark();
                let high_watermark = if watermark > 0 { head.min(watermark) } else { head };
                if high_watermark <= lib {
                    return None;
                }
                self.chain.fetch_block_by_num(high_watermark)?
            }
        };

        let chain_id = self.chain.chain_id();
        let mut prepare =
            PbftPrepare::new(current_view, block.num, block.id, signer.public_key(), chain_id);
        prepare.sign(&signer);
        self.add_pbft_prepare(prepare.clone());
        self.signals.emit_outgoing(PbftMessage::Prepare(prepare.clone()));
        self.my_prepare = Some(block.id);
        trace!(
            target: "quorum::pbft::db",
            view = current_view,
            block_num = block.num,
            "sent prepare"
        );
        Some(prepare)
    }

    /// Broadcast this node's commit for the highest prepared block. Returns the commit to
    /// cache.
    pub fn send_and_add_pbft_commit(
        &mut self,
        cached: Option<&PbftCommit>,
        current_view: View,
    ) -> Option<PbftCommit> {
        let signer = self.signer.clone()?;
        if let Some(cached) = cached {
            let mut commit = cached.clone();
            refresh(&mut commit.uuid, &mut commit.timestamp);
            commit.sign(&signer);
            self.signals.emit_outgoing(PbftMessage::Commit(commit.clone()));
            return Some(commit);
        }

        let (block_id, block_num) = self.prepared_state().map(|s| (s.block_id, s.block_num))?;
        self.chain.fetch_block_by_id(&block_id)?;
        let chain_id = self.chain.chain_id();
        let mut commit =
            PbftCommit::new(current_view, block_num, block_id, signer.public_key(), chain_id);
        commit.sign(&signer);
        self.add_pbft_commit(commit.clone());
        self.signals.emit_outgoing(PbftMessage::Commit(commit.clone()));
        trace!(target: "quorum::pbft::db", view = current_view, block_num, "sent commit");
        Some(commit)
    }

    // --- view changes ---

    /// Record a view change under its target view.
    pub fn add_pbft_view_change(&mut self, view_change: PbftViewChange) {
        if !self.is_valid_view_change(&view_change) {
            debug!(
                target: "quorum::pbft::db",
                signer = %view_change.public_key,
                "dropping invalid view change"
            );
            return;
        }
        let schedule = self.lscb_schedule();
        let target = view_change.target_view;
        let index = match self.view_by_num.get(&target) {
            Some(&index) => index,
            None => {
                self.view_states.push(PbftViewState {
                    view: target,
                    view_changes: Vec::new(),
                    should_view_changed: false,
                });
                self.view_by_num.insert(target, self.view_states.len() - 1);
                self.view_states.len() - 1
            }
        };
        let state = &mut self.view_states[index];
        let duplicate = state
            .view_changes
            .iter()
            .any(|vc| vc.uuid == view_change.uuid || vc.public_key == view_change.public_key);
        if !duplicate {
            state.view_changes.push(view_change);
        }
        let signers = schedule.count_signers(state.view_changes.iter().map(|vc| &vc.public_key));
        if !state.should_view_changed && signers >= schedule.quorum() {
            state.should_view_changed = true;
            debug!(target: "quorum::pbft::db", view = target, "view change quorum reached");
        }
    }

    /// Lowest target view above `current_view` requested by at least `f + 1` producers, or 0
    pub fn should_view_change(&self, current_view: View) -> View {
        let schedule = self.lscb_schedule();
        self.view_by_num
            .range((Bound::Excluded(current_view), Bound::Unbounded))
            .find(|(_, index)| {
                let state = &self.view_states[**index];
                schedule.count_signers(state.view_changes.iter().map(|vc| &vc.public_key)) >=
                    schedule.weak_quorum()
            })
            .map_or(0, |(view, _)| *view)
    }

    /// Whether `target_view` gathered a view-change quorum
    pub fn should_new_view(&self, target_view: View) -> bool {
        self.view_state(target_view).is_some_and(|state| state.should_view_changed)
    }

    /// Primary key for `target_view`, round-robin over the last stable checkpoint's schedule
    pub fn get_new_view_primary_key(&self, target_view: View) -> Option<PublicKey> {
        self.lscb_schedule().primary(target_view).map(|producer| producer.block_signing_key)
    }

    /// Whether this node is the primary of `target_view`
    pub fn is_new_primary(&self, target_view: View) -> bool {
        match (self.get_new_view_primary_key(target_view), self.public_key()) {
            (Some(primary), Some(mine)) => primary == mine,
            _ => false,
        }
    }

    /// Highest view with a view-change quorum, or 0
    pub fn get_proposed_new_view_num(&self) -> View {
        self.view_by_num
            .iter()
            .rev()
            .find(|(_, index)| self.view_states[**index].should_view_changed)
            .map_or(0, |(view, _)| *view)
    }

    /// Bundle the prepare quorum of the highest prepared block, signed by this node
    pub fn generate_prepared_certificate(&self) -> Option<PbftPreparedCertificate> {
        let signer = self.signer.as_ref()?;
        let state = self.prepared_state()?;
        let block = self.chain.fetch_block_by_id(&state.block_id)?;
        let schedule = &block.active_schedule;
        let votes = state.prepares.iter().map(|p| (p.view, &p.public_key));
        let view = *quorum_views(votes, schedule).last()?;
        let prepares = state
            .prepares
            .iter()
            .filter(|p| p.view == view && schedule.contains_key(&p.public_key))
            .cloned()
            .collect();
        let mut certificate = PbftPreparedCertificate {
            block_id: state.block_id,
            block_num: state.block_num,
            prepares,
            public_key: signer.public_key(),
            signature: Default::default(),
        };
        certificate.sign(signer);
        Some(certificate)
    }

    /// Bundle the view changes for `target_view`, signed by this node
    pub fn generate_view_changed_certificate(
        &self,
        target_view: View,
    ) -> Option<PbftViewChangedCertificate> {
        let signer = self.signer.as_ref()?;
        let state = self.view_state(target_view).filter(|state| state.should_view_changed)?;
        let mut certificate = PbftViewChangedCertificate {
            view: state.view,
            view_changes: state.view_changes.clone(),
            public_key: signer.public_key(),
            signature: Default::default(),
        };
        certificate.sign(signer);
        Some(certificate)
    }

    /// Broadcast this node's view change. A cached view change is re-signed and re-sent.
    /// Returns the view change to cache.
    pub fn send_and_add_pbft_view_change(
        &mut self,
        cached: Option<&PbftViewChange>,
        prepared: Option<PbftPreparedCertificate>,
        current_view: View,
        target_view: View,
    ) -> Option<PbftViewChange> {
        let signer = self.signer.clone()?;
        if let Some(cached) = cached {
            let mut view_change = cached.clone();
            refresh(&mut view_change.uuid, &mut view_change.timestamp);
            view_change.sign(&signer);
            self.signals.emit_outgoing(PbftMessage::ViewChange(view_change.clone()));
            return Some(view_change);
        }

        let stable_checkpoint =
            self.get_stable_checkpoint_by_id(&self.chain.last_stable_checkpoint_block_id());
        let mut view_change = PbftViewChange::new(
            current_view,
            target_view,
            prepared,
            stable_checkpoint,
            signer.public_key(),
            self.chain.chain_id(),
        );
        view_change.sign(&signer);
        self.signals.emit_outgoing(PbftMessage::ViewChange(view_change.clone()));
        self.add_pbft_view_change(view_change.clone());
        debug!(target: "quorum::pbft::db", current_view, target_view, "sent view change");
        Some(view_change)
    }

    /// As primary of `target_view`, announce the new view built from `certificate`
    pub fn send_pbft_new_view(
        &mut self,
        certificate: Option<&PbftViewChangedCertificate>,
        target_view: View,
    ) -> Option<PbftNewView> {
        if !self.is_new_primary(target_view) {
            return None;
        }
        let signer = self.signer.clone()?;
        let certificate = certificate.filter(|c| c.public_key == signer.public_key())?;
        let (prepared, stable_checkpoint) = self.highest_certificates(&certificate.view_changes);
        let mut new_view = PbftNewView::new(
            target_view,
            prepared,
            stable_checkpoint,
            certificate.clone(),
            signer.public_key(),
            self.chain.chain_id(),
        );
        new_view.sign(&signer);
        self.signals.emit_outgoing(PbftMessage::NewView(new_view.clone()));
        info!(target: "quorum::pbft::db", view = target_view, "sent new view");
        Some(new_view)
    }

    /// Highest valid prepared certificate and stable checkpoint among `view_changes`
    fn highest_certificates(
        &self,
        view_changes: &[PbftViewChange],
    ) -> (Option<PbftPreparedCertificate>, Option<PbftStableCheckpoint>) {
        let mut prepared: Option<&PbftPreparedCertificate> = None;
        let mut stable: Option<&PbftStableCheckpoint> = None;
        for view_change in view_changes {
            if let Some(certificate) = &view_change.prepared {
                if certificate.block_num > prepared.map_or(0, |c| c.block_num) &&
                    self.is_valid_prepared_certificate(certificate)
                {
                    prepared = Some(certificate);
                }
            }
            if let Some(checkpoint) = &view_change.stable_checkpoint {
                if checkpoint.block_num > stable.map_or(0, |c| c.block_num) &&
                    self.is_valid_stable_checkpoint(checkpoint)
                {
                    stable = Some(checkpoint);
                }
            }
        }
        (prepared.cloned(), stable.cloned())
    }

    /// Check a new view against the expected primary and the local view-change evidence.
    ///
    /// Valid view changes embedded in the new view are recorded as a side effect.
    pub fn validate_new_view(
        &mut self,
        new_view: &PbftNewView,
        expected_primary: Option<PublicKey>,
    ) -> Result<(), PbftError> {
        let chain_id = self.chain.chain_id();
        if new_view.chain_id != chain_id {
            return Err(PbftError::WrongChain { expected: chain_id, got: new_view.chain_id });
        }
        if expected_primary != Some(new_view.public_key) {
            return Err(PbftError::UnexpectedPrimary {
                expected: expected_primary,
                got: new_view.public_key,
            });
        }
        if !new_view.is_signature_valid() {
            return Err(PbftError::InvalidSignature(new_view.public_key));
        }
        if new_view.view_changed.view != new_view.view {
            return Err(PbftError::TargetViewMismatch {
                view: new_view.view,
                certificate_view: new_view.view_changed.view,
            });
        }
        let certificate = &new_view.view_changed;
        if certificate.public_key != new_view.public_key || !certificate.is_signature_valid() {
            return Err(PbftError::InvalidSignature(certificate.public_key));
        }
        if let Some(prepared) = new_view.prepared.as_ref().filter(|p| !p.is_signature_valid()) {
            return Err(PbftError::InvalidSignature(prepared.public_key));
        }

        let schedule = self.lscb_schedule();
        let mut signers = BTreeSet::new();
        for view_change in &new_view.view_changed.view_changes {
            if view_change.target_view == new_view.view && self.is_valid_view_change(view_change) {
                signers.insert(view_change.public_key);
                self.add_pbft_view_change(view_change.clone());
            }
        }
        let count = schedule.count_signers(&signers);
        if count < schedule.quorum() {
            return Err(PbftError::InsufficientViewChanges { count, threshold: schedule.quorum() });
        }
        if !self.should_new_view(new_view.view) {
            return Err(PbftError::NotViewChanged(new_view.view));
        }

        let (prepared, stable_checkpoint) =
            self.highest_certificates(&new_view.view_changed.view_changes);
        if prepared != new_view.prepared {
            return Err(PbftError::PreparedCertificateMismatch);
        }
        if stable_checkpoint != new_view.stable_checkpoint {
            return Err(PbftError::StableCheckpointMismatch);
        }
        Ok(())
    }

    /// A view change whose stable checkpoint is behind the local one is stale
    pub fn should_stop_view_change(&self, view_change: &PbftViewChange) -> bool {
        let claimed = view_change.stable_checkpoint_num();
        claimed > 0 && self.chain.last_stable_checkpoint_block_num() > claimed
    }

    /// Forget block states and view states up to `view`, and the reserved prepare.
    ///
    /// Called when entering a new view; the new view's certificates repopulate what matters.
    pub fn prune_pbft_index(&mut self, view: View) {
        self.states.clear();
        self.rebuild_state_indexes();
        self.view_states.retain(|state| state.view > view);
        self.view_by_num =
            self.view_states.iter().enumerate().map(|(index, state)| (state.view, index)).collect();
        self.my_prepare = None;
    }

    // --- checkpoints ---

    /// Record a checkpoint; the block becomes stable on a checkpoint quorum.
    pub fn add_pbft_checkpoint(&mut self, checkpoint: PbftCheckpoint) {
        if !self.is_valid_checkpoint(&checkpoint) {
            debug!(
                target: "quorum::pbft::db",
                signer = %checkpoint.public_key,
                block_num = checkpoint.block_num,
                "dropping invalid checkpoint"
            );
            return;
        }
        let Some(block) = self.chain.fetch_block_by_id(&checkpoint.block_id) else { return };
        let index = match self.checkpoint_by_id.get(&block.id) {
            Some(&index) => index,
            None => {
                self.checkpoint_states.push(PbftCheckpointState {
                    block_id: block.id,
                    block_num: block.num,
                    checkpoints: Vec::new(),
                    is_stable: false,
                });
                self.checkpoint_by_id.insert(block.id, self.checkpoint_states.len() - 1);
                self.checkpoint_states.len() - 1
            }
        };
        let state = &mut self.checkpoint_states[index];
        let duplicate = state
            .checkpoints
            .iter()
            .any(|c| c.uuid == checkpoint.uuid || c.public_key == checkpoint.public_key);
        if !duplicate {
            state.checkpoints.push(checkpoint);
        }
        let schedule = &block.active_schedule;
        let signers = schedule.count_signers(state.checkpoints.iter().map(|c| &c.public_key));
        if !state.is_stable && signers >= schedule.quorum() {
            state.is_stable = true;
            info!(
                target: "quorum::pbft::db",
                block_num = block.num,
                block_id = %block.id,
                "checkpoint stable"
            );
        }
    }

    fn is_checkpoint_num(&self, num: BlockNum, watermarks: &[BlockNum]) -> bool {
        self.checkpoint_interval == 1 ||
            num % self.checkpoint_interval == 1 ||
            watermarks.contains(&num)
    }

    /// Sign checkpoints for irreversible checkpoint blocks this node has not signed yet, or
    /// re-send the last stable checkpoint when there are none. Returns what was sent.
    pub fn send_pbft_checkpoint(&mut self) -> Vec<PbftCheckpoint> {
        let Some(signer) = self.signer.clone() else { return Vec::new() };
        let Some(&(highest_committed, _)) = self.committed_index.last() else { return Vec::new() };
        let my_key = signer.public_key();
        let lscb = self.chain.last_stable_checkpoint_block_num();
        let upper = highest_committed.min(self.chain.last_irreversible_block_num());
        let watermarks = self.chain.pbft_watermarks();

        let mut pending = Vec::new();
        for num in lscb.max(1) + 1..=upper {
            if !self.is_checkpoint_num(num, &watermarks) {
                continue;
            }
            let Some(block) = self.chain.fetch_block_by_num(num) else { continue };
            let signed = self
                .checkpoint_state(&block.id)
                .is_some_and(|state| state.checkpoints.iter().any(|c| c.public_key == my_key));
            if !signed {
                pending.push(block);
            }
        }

        let chain_id = self.chain.chain_id();
        let mut sent = Vec::new();
        if !pending.is_empty() {
            for block in pending {
                let mut checkpoint = PbftCheckpoint::new(block.num, block.id, my_key, chain_id);
                checkpoint.sign(&signer);
                self.add_pbft_checkpoint(checkpoint.clone());
                sent.push(checkpoint);
            }
        } else if lscb > 0 {
            let lscb_id = self.chain.last_stable_checkpoint_block_id();
            let mut checkpoint = PbftCheckpoint::new(lscb, lscb_id, my_key, chain_id);
            checkpoint.sign(&signer);
            sent.push(checkpoint);
        }
        for checkpoint in &sent {
            self.signals.emit_outgoing(PbftMessage::Checkpoint(checkpoint.clone()));
        }
        sent
    }

    /// Advance the chain's stable checkpoint to the highest stable checkpoint state, making it
    /// irreversible if it is not yet, and prune everything at or below it.
    pub fn checkpoint_local(&mut self) {
        let lscb = self.chain.last_stable_checkpoint_block_num();
        let Some((id, num)) = self
            .checkpoint_states
            .iter()
            .filter(|state| state.is_stable && state.block_num > lscb)
            .max_by_key(|state| state.block_num)
            .map(|state| (state.block_id, state.block_num))
        else {
            return;
        };

        info!(target: "quorum::pbft::db", block_num = num, block_id = %id, "new stable checkpoint");
        self.chain.set_stable_checkpoint(id);
        if self.chain.last_irreversible_block_num() < num {
            self.chain.pbft_commit_local(id);
        }

        self.checkpoint_states.retain(|state| state.block_num >= num);
        self.checkpoint_by_id = self
            .checkpoint_states
            .iter()
            .enumerate()
            .map(|(index, state)| (state.block_id, index))
            .collect();
        self.states.retain(|state| state.block_num > num);
        self.rebuild_state_indexes();
    }

    /// The stable checkpoint proof for `block_id`, if that block is stable
    pub fn get_stable_checkpoint_by_id(&self, block_id: &B256) -> Option<PbftStableCheckpoint> {
        let state = self.checkpoint_state(block_id).filter(|state| state.is_stable)?;
        Some(PbftStableCheckpoint {
            block_num: state.block_num,
            block_id: state.block_id,
            checkpoints: state.checkpoints.clone(),
            chain_id: self.chain.chain_id(),
        })
    }

    // --- validation ---

    /// Chain, signature and signer checks for a prepare
    pub fn is_valid_prepare(&self, prepare: &PbftPrepare) -> bool {
        prepare.chain_id == self.chain.chain_id() &&
            prepare.is_signature_valid() &&
            self.should_recv_pbft_msg(&prepare.public_key)
    }

    /// Chain, signature and signer checks for a commit
    pub fn is_valid_commit(&self, commit: &PbftCommit) -> bool {
        commit.chain_id == self.chain.chain_id() &&
            commit.is_signature_valid() &&
            self.should_recv_pbft_msg(&commit.public_key)
    }

    /// Chain, signature and signer checks for a view change. Embedded certificates are only
    /// checked when building or validating a new view.
    pub fn is_valid_view_change(&self, view_change: &PbftViewChange) -> bool {
        view_change.chain_id == self.chain.chain_id() &&
            view_change.is_signature_valid() &&
            self.should_recv_pbft_msg(&view_change.public_key)
    }

    /// A checkpoint must name a known block between the last stable checkpoint and the head,
    /// signed by a producer scheduled for it
    pub fn is_valid_checkpoint(&self, checkpoint: &PbftCheckpoint) -> bool {
        if checkpoint.chain_id != self.chain.chain_id() ||
            checkpoint.block_num > self.chain.head_block_num() ||
            checkpoint.block_num <= self.chain.last_stable_checkpoint_block_num() ||
            !checkpoint.is_signature_valid()
        {
            return false;
        }
        self.chain
            .fetch_block_by_id(&checkpoint.block_id)
            .is_some_and(|block| block.active_schedule.contains_key(&checkpoint.public_key))
    }

    /// A prepared certificate needs a single-view prepare quorum on one fork ending at the
    /// certified block. Certificates at or below the last stable checkpoint are treated as null.
    pub fn is_valid_prepared_certificate(&self, certificate: &PbftPreparedCertificate) -> bool {
        let lscb = self.chain.last_stable_checkpoint_block_num();
        if certificate.block_num <= lscb {
            return true;
        }
        if !certificate.is_signature_valid() ||
            !certificate.prepares.iter().all(|prepare| self.is_valid_prepare(prepare))
        {
            return false;
        }

        let schedule = self
            .chain
            .fetch_block_by_id(&certificate.block_id)
            .map(|block| block.active_schedule)
            .unwrap_or_else(|| self.lscb_schedule());
        let votes = certificate.prepares.iter().map(|p| (p.view, &p.public_key));
        if quorum_views(votes, &schedule).is_empty() {
            return false;
        }

        let mut non_fork = 0;
        let mut refs = Vec::with_capacity(certificate.prepares.len());
        for prepare in &certificate.prepares {
            if prepare.block_num <= lscb {
                non_fork += 1;
            } else {
                refs.push(BlockRef { id: prepare.block_id, num: prepare.block_num });
            }
        }
        let target = BlockRef { id: certificate.block_id, num: certificate.block_num };
        self.is_valid_longest_fork(&target, refs, schedule.quorum(), non_fork)
    }

    fn is_valid_longest_fork(
        &self,
        target: &BlockRef,
        refs: Vec<BlockRef>,
        threshold: usize,
        non_fork: usize,
    ) -> bool {
        let longest = self
            .fetch_fork_from(refs)
            .into_iter()
            .fold(Vec::new(), |longest, fork| {
                if fork.len() > longest.len() { fork } else { longest }
            });
        if longest.len() + non_fork < threshold {
            return false;
        }
        longest.last().is_none_or(|lowest| lowest == target)
    }

    /// A stable checkpoint needs a checkpoint quorum for its own block. Checkpoints at or below
    /// the local one are trivially valid.
    pub fn is_valid_stable_checkpoint(&self, stable: &PbftStableCheckpoint) -> bool {
        if stable.block_num <= self.chain.last_stable_checkpoint_block_num() {
            return true;
        }
        if stable.chain_id != self.chain.chain_id() {
            return false;
        }
        let consistent = stable.checkpoints.iter().all(|checkpoint| {
            checkpoint.block_id == stable.block_id &&
                checkpoint.block_num == stable.block_num &&
                self.is_valid_checkpoint(checkpoint)
        });
        if !consistent {
            return false;
        }
        self.chain.fetch_block_by_id(&stable.block_id).is_some_and(|block| {
            let schedule = &block.active_schedule;
            let signers = schedule.count_signers(stable.checkpoints.iter().map(|c| &c.public_key));
            signers >= schedule.quorum()
        })
    }

    // --- forks ---

    /// Split `refs` into chains of blocks linked by parent ids, highest first within each
    /// chain. Chains not extending the LIB are discarded.
    pub fn fetch_fork_from(&self, mut refs: Vec<BlockRef>) -> Vec<Vec<BlockRef>> {
        refs.sort_by(|a, b| b.num.cmp(&a.num));
        let mut forks = Vec::new();
        while !refs.is_empty() {
            let fork = self.fetch_first_fork_from(&mut refs);
            let extends_lib = fork
                .last()
                .and_then(|lowest| self.chain.fetch_block_by_id(&lowest.id))
                .is_some_and(|block| self.extends_lib(&block));
            if extends_lib {
                forks.push(fork);
            }
        }
        forks
    }

    /// Remove and return the chain hanging below the first (highest) entry of `refs`, which
    /// must be sorted by descending height.
    pub fn fetch_first_fork_from(&self, refs: &mut Vec<BlockRef>) -> Vec<BlockRef> {
        let mut fork = Vec::new();
        let (Some(first), Some(last)) = (refs.first().copied(), refs.last().copied()) else {
            return fork;
        };
        if refs.len() == 1 {
            refs.clear();
            fork.push(first);
            return fork;
        }

        let (high, low) = (first.num, last.num);
        let (mut id, mut num) = (first.id, first.num);
        while (low..=high).contains(&num) && !refs.is_empty() {
            let block = self.chain.fetch_block_by_id(&id);
            refs.retain(|r| {
                if r.id != id {
                    return true;
                }
                if block.is_some() {
                    fork.push(*r);
                }
                false
            });
            let Some(block) = block else { break };
            let Some(parent_num) = num.checked_sub(1) else { break };
            id = block.previous;
            num = parent_num;
        }
        fork
    }

    /// Whether `block` is the LIB or one of its descendants
    fn extends_lib(&self, block: &BlockInfo) -> bool {
        let lib_num = self.chain.last_irreversible_block_num();
        let lib_id = self.chain.last_irreversible_block_id();
        if lib_id == B256::ZERO {
            return true;
        }
        let mut current = Some(block.clone());
        while let Some(block) = current {
            if block.num == lib_num {
                return block.id == lib_id;
            }
            if block.num < lib_num {
                return false;
            }
            current = self.chain.fetch_block_by_id(&block.previous);
        }
        false
    }

    // --- arena maintenance ---

    fn state_index_or_insert(&mut self, block: &BlockInfo) -> usize {
        if let Some(&index) = self.state_by_id.get(&block.id) {
            return index;
        }
        self.states.push(PbftState {
            block_id: block.id,
            block_num: block.num,
            prepares: Vec::new(),
            should_prepared: false,
            commits: Vec::new(),
            should_committed: false,
        });
        let index = self.states.len() - 1;
        self.state_by_id.insert(block.id, index);
        index
    }

    fn rebuild_state_indexes(&mut self) {
        self.state_by_id =
            self.states.iter().enumerate().map(|(index, s)| (s.block_id, index)).collect();
        self.prepared_index = self
            .states
            .iter()
            .filter(|s| s.should_prepared)
            .map(|s| (s.block_num, s.block_id))
            .collect();
        self.committed_index = self
            .states
            .iter()
            .filter(|s| s.should_committed)
            .map(|s| (s.block_num, s.block_id))
            .collect();
    }
}

/// Views, ascending, in which distinct scheduled signers reach a quorum of `schedule`.
fn quorum_views<'a>(
    votes: impl Iterator<Item = (View, &'a PublicKey)>,
    schedule: &ProducerSchedule,
) -> Vec<View> {
    let mut signers: BTreeMap<View, BTreeSet<&PublicKey>> = BTreeMap::new();
    for (view, key) in votes {
        if schedule.contains_key(key) {
            signers.entry(view).or_default().insert(key);
        }
    }
    signers
        .into_iter()
        .filter(|(_, keys)| keys.len() >= schedule.quorum())
        .map(|(view, _)| view)
        .collect()
}

/// Give a re-broadcast message a new identity.
fn refresh(uuid: &mut Uuid, timestamp: &mut u64) {
    *uuid = new_uuid();
    *timestamp = now_micros();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{producer_keys, MemoryChain};

    fn database(n: usize) -> (PbftDatabase<MemoryChain>, Vec<PrivateKey>) {
        let keys = producer_keys(n);
        let mut chain = MemoryChain::with_producers(&keys);
        chain.produce_blocks(4);
        let db = PbftDatabase::new(chain, Some(keys[0].clone()), PbftSignals::default(), 100);
        (db, keys)
    }

    fn prepare(
        db: &PbftDatabase<MemoryChain>,
        key: &PrivateKey,
        view: View,
        num: BlockNum,
    ) -> PbftPrepare {
        let block = db.chain().fetch_block_by_num(num).unwrap();
        let chain_id = db.chain().chain_id();
        let mut prepare = PbftPrepare::new(view, num, block.id, key.public_key(), chain_id);
        prepare.sign(key);
        prepare
    }

    #[test]
    fn test_quorum_views_counts_distinct_scheduled_signers() {
        let keys = producer_keys(4);
        let chain = MemoryChain::with_producers(&keys);
        let schedule = chain.head_schedule();
        let stranger = PrivateKey::from_seed(b"stranger").public_key();
        let k: Vec<_> = keys.iter().map(PrivateKey::public_key).collect();

        let votes = [
            (0, &k[0]),
            (0, &k[0]),
            (0, &k[1]),
            (0, &stranger),
            (1, &k[0]),
            (1, &k[1]),
            (1, &k[2]),
        ];
        assert_eq!(quorum_views(votes.into_iter(), &schedule), vec![1]);
    }

    #[test]
    fn test_prepare_counts_for_ancestors() {
        let (mut db, keys) = database(4);
        for key in &keys[..3] {
            let p = prepare(&db, key, 0, 4);
            db.add_pbft_prepare(p);
        }
        assert!(db.should_prepared());
        for num in 2..=4 {
            let id = db.chain().fetch_block_by_num(num).unwrap().id;
            assert!(db.pbft_state(&id).unwrap().should_prepared, "block {num}");
        }
        let certificate = db.generate_prepared_certificate().unwrap();
        assert_eq!(certificate.block_num, 4);
        assert_eq!(certificate.prepares.len(), 3);
        assert!(db.is_valid_prepared_certificate(&certificate));
    }

    #[test]
    fn test_votes_split_across_views_do_not_form_quorum() {
        let (mut db, keys) = database(4);
        let a = prepare(&db, &keys[0], 0, 3);
        let b = prepare(&db, &keys[1], 0, 3);
        let c = prepare(&db, &keys[2], 1, 3);
        db.add_pbft_prepare(a);
        db.add_pbft_prepare(b);
        db.add_pbft_prepare(c);
        assert!(!db.should_prepared());
    }

    #[test]
    fn test_rejects_foreign_chain_and_forged_signature() {
        let (mut db, keys) = database(4);
        let mut foreign = prepare(&db, &keys[1], 0, 3);
        foreign.chain_id = B256::repeat_byte(0xee);
        foreign.sign(&keys[1]);
        assert!(!db.is_valid_prepare(&foreign));

        let mut forged = prepare(&db, &keys[1], 0, 3);
        forged.public_key = keys[2].public_key();
        assert!(!db.is_valid_prepare(&forged));

        db.add_pbft_prepare(forged);
        assert!(db.pbft_state(&db.chain().fetch_block_by_num(3).unwrap().id).is_none());
    }

    #[test]
    fn test_prepare_capped_at_watermark() {
        let keys = producer_keys(4);
        let mut chain = MemoryChain::with_producers(&keys);
        chain.produce_blocks(3);
        chain.change_schedule(&keys);
        chain.produce_blocks(3);
        let watermark = chain.pbft_watermarks()[0];
        let mut db = PbftDatabase::new(chain, Some(keys[0].clone()), PbftSignals::default(), 100);

        let sent = db.send_and_add_pbft_prepare(None, 0).unwrap();
        assert_eq!(sent.block_num, watermark);

        // the cached prepare is re-signed with a new identity
        let resent = db.send_and_add_pbft_prepare(Some(&sent), 0).unwrap();
        assert_ne!(resent.uuid, sent.uuid);
        assert_eq!(resent.block_id, sent.block_id);
        assert!(resent.is_signature_valid());
    }

    #[test]
    fn test_fetch_fork_from_splits_branches() {
        let (mut db, _) = database(4);
        let b3 = db.chain().fetch_block_by_num(3).unwrap();
        let b4 = db.chain().fetch_block_by_num(4).unwrap();
        let side = db.chain_mut().push_fork_block(&b3.id);

        let refs = vec![
            BlockRef { id: b3.id, num: 3 },
            BlockRef { id: b4.id, num: 4 },
            BlockRef { id: side.id, num: 4 },
        ];
        let forks = db.fetch_fork_from(refs);
        assert_eq!(forks.len(), 2);
        assert_eq!(forks[0].len() + forks[1].len(), 3);
        assert!(forks.iter().any(|fork| fork.len() == 2 && fork[1].id == b3.id));
    }

    #[test]
    fn test_checkpoint_quorum_and_local_checkpoint() {
        let (mut db, keys) = database(4);
        let b2 = db.chain().fetch_block_by_num(2).unwrap();
        db.chain_mut().pbft_commit_local(b2.id);

        for key in &keys[..3] {
            let chain_id = db.chain().chain_id();
            let mut checkpoint = PbftCheckpoint::new(2, b2.id, key.public_key(), chain_id);
            checkpoint.sign(key);
            db.add_pbft_checkpoint(checkpoint);
        }
        assert!(db.checkpoint_state(&b2.id).unwrap().is_stable);
        let stable = db.get_stable_checkpoint_by_id(&b2.id).unwrap();
        assert!(db.is_valid_stable_checkpoint(&stable));

        db.checkpoint_local();
        assert_eq!(db.chain().last_stable_checkpoint_block_num(), 2);
        assert_eq!(db.chain().last_stable_checkpoint_block_id(), b2.id);
    }

    fn checkpoint(
        db: &PbftDatabase<MemoryChain>,
        key: &PrivateKey,
        num: BlockNum,
    ) -> PbftCheckpoint {
        let block = db.chain().fetch_block_by_num(num).unwrap();
        let chain_id = db.chain().chain_id();
        let mut checkpoint = PbftCheckpoint::new(num, block.id, key.public_key(), chain_id);
        checkpoint.sign(key);
        checkpoint
    }

    #[test]
    fn test_checkpoint_local_prunes_up_to_the_stable_checkpoint() {
        let (mut db, keys) = database(4);
        let ids: Vec<B256> =
            (2..=5).map(|num| db.chain().fetch_block_by_num(num).unwrap().id).collect();
        let p = prepare(&db, &keys[1], 0, 5);
        db.add_pbft_prepare(p);
        assert!(ids.iter().all(|id| db.pbft_state(id).is_some()));

        for num in [2, 3] {
            for key in &keys[..3] {
                let c = checkpoint(&db, key, num);
                db.add_pbft_checkpoint(c);
            }
        }
        let c = checkpoint(&db, &keys[1], 4);
        db.add_pbft_checkpoint(c);

        db.checkpoint_local();
        assert_eq!(db.chain().last_stable_checkpoint_block_num(), 3);
        assert_eq!(db.chain().last_irreversible_block_num(), 3);

        assert!(db.checkpoint_state(&ids[0]).is_none());
        assert!(db.checkpoint_state(&ids[1]).is_some_and(|state| state.is_stable));
        assert!(db.checkpoint_state(&ids[2]).is_some_and(|state| !state.is_stable));
        assert!(db.pbft_state(&ids[0]).is_none());
        assert!(db.pbft_state(&ids[1]).is_none());
        assert_eq!(db.pbft_state(&ids[2]).map(|state| state.block_num), Some(4));
        assert_eq!(db.pbft_state(&ids[3]).map(|state| state.block_num), Some(5));
    }

    #[test]
    fn test_prune_pbft_index_keeps_only_later_views() {
        let (mut db, keys) = database(4);
        let head = db.chain().head_block().id;
        let p = prepare(&db, &keys[1], 0, 5);
        db.add_pbft_prepare(p);
        assert!(db.send_and_add_pbft_prepare(None, 0).is_some());
        for target in 1..=3 {
            let chain_id = db.chain().chain_id();
            let mut vc = PbftViewChange::new(0, target, None, None, keys[1].public_key(), chain_id);
            vc.sign(&keys[1]);
            db.add_pbft_view_change(vc);
        }

        db.prune_pbft_index(2);
        assert!(db.pbft_state(&head).is_none());
        assert!(db.my_prepare.is_none());
        assert!(db.view_state(1).is_none());
        assert!(db.view_state(2).is_none());
        assert_eq!(db.view_state(3).map(|state| state.view_changes.len()), Some(1));

        // indexes stay consistent with the surviving entries
        let p = prepare(&db, &keys[2], 2, 5);
        db.add_pbft_prepare(p);
        assert_eq!(db.pbft_state(&head).map(|state| state.block_num), Some(5));
    }
}
