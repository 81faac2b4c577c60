//! PBFT state machine
//!
//! ```text
//!              2f+1 prepares                    2f+1 commits, LIB applied
//!  Committed ─────────────────► Prepared ─────────────────────────────► Committed
//!      │                            │
//!      │ timeout / f+1 view changes │
//!      ▼                            ▼
//!  ViewChange ──── valid new view ────► Prepared | Committed
//! ```
//!
//! The machine owns the per-round caches and the view-change timer; all quorum evidence lives in
//! the [`PbftDatabase`] passed to each event.

use crate::{
    PbftChain, PbftCommit, PbftDatabase, PbftNewView, PbftPrepare, PbftPreparedCertificate,
    PbftViewChange, PbftViewChangedCertificate, View,
};
use tracing::{debug, info, warn};

/// View changes and new views more than this many views ahead of the current view are dropped.
pub const MAX_VIEW_DISTANCE: View = 32;

/// Consensus phase of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsmState {
    /// Steady state, waiting for a prepare quorum
    Committed,
    /// Prepare quorum reached, collecting commits
    Prepared {
        /// Local commit requested and not yet applied by the chain
        pending_commit_local: bool,
    },
    /// Trying to move to a new view
    ViewChange,
}

impl PsmState {
    /// Short name, for logs
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Prepared { .. } => "prepared",
            Self::ViewChange => "view_change",
        }
    }
}

/// The PBFT state machine
#[derive(Debug, Clone)]
pub struct PsmMachine {
    state: PsmState,
    current_view: View,
    target_view: View,

    prepares_cache: Option<PbftPrepare>,
    commits_cache: Option<PbftCommit>,
    view_changes_cache: Option<PbftViewChange>,
    prepared_certificate: Option<PbftPreparedCertificate>,
    view_changed_certificate: Option<PbftViewChangedCertificate>,

    view_change_timer: u32,
    target_view_retries: u32,
}

impl Default for PsmMachine {
    fn default() -> Self {
        Self::new(0)
    }
}

impl PsmMachine {
    /// A committed machine at `current_view`
    pub const fn new(current_view: View) -> Self {
        Self {
            state: PsmState::Committed,
            current_view,
            target_view: current_view.saturating_add(1),
            prepares_cache: None,
            commits_cache: None,
            view_changes_cache: None,
            prepared_certificate: None,
            view_changed_certificate: None,
            view_change_timer: 0,
            target_view_retries: 0,
        }
    }

    /// Current phase
    pub const fn state(&self) -> PsmState {
        self.state
    }

    /// Current view
    pub const fn current_view(&self) -> View {
        self.current_view
    }

    /// View this node is moving to
    pub const fn target_view(&self) -> View {
        self.target_view
    }

    /// Ticks since the last progress
    pub const fn view_change_timer(&self) -> u32 {
        self.view_change_timer
    }

    /// View changes sent for the current target view
    pub const fn target_view_retries(&self) -> u32 {
        self.target_view_retries
    }

    /// Prepare this node last sent
    pub const fn prepares_cache(&self) -> Option<&PbftPrepare> {
        self.prepares_cache.as_ref()
    }

    /// Commit this node last sent
    pub const fn commits_cache(&self) -> Option<&PbftCommit> {
        self.commits_cache.as_ref()
    }

    /// View change this node last sent
    pub const fn view_changes_cache(&self) -> Option<&PbftViewChange> {
        self.view_changes_cache.as_ref()
    }

    /// Advance the view-change timer by one tick
    pub fn tick_view_change_timer(&mut self) {
        self.view_change_timer = self.view_change_timer.saturating_add(1);
    }

    /// Reset the view-change timer
    pub fn reset_view_change_timer(&mut self) {
        self.view_change_timer = 0;
    }

    // --- events ---

    /// Inbound prepare
    pub fn on_prepare<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>, prepare: PbftPrepare) {
        if prepare.view < self.current_view {
            debug!(
                target: "quorum::psm",
                view = prepare.view,
                current_view = self.current_view,
                "ignoring stale prepare"
            );
            return;
        }
        match self.state {
            PsmState::Committed => {
                db.add_pbft_prepare(prepare);
                if db.should_prepared() {
                    self.transit_to_prepared(db);
                }
            }
            PsmState::Prepared { .. } => db.add_pbft_prepare(prepare),
            PsmState::ViewChange => {
                debug!(target: "quorum::psm", "ignoring prepare during view change");
            }
        }
    }

    /// Send or re-send this node's prepare
    pub fn send_prepare<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        match self.state {
            PsmState::Committed => {
                let cached = self.prepares_cache.take();
                self.prepares_cache =
                    db.send_and_add_pbft_prepare(cached.as_ref(), self.current_view).or(cached);
                if db.should_prepared() {
                    self.transit_to_prepared(db);
                }
            }
            PsmState::Prepared { .. } => {
                if let Some(cached) = self.prepares_cache.take() {
                    self.prepares_cache = db
                        .send_and_add_pbft_prepare(Some(&cached), self.current_view)
                        .or(Some(cached));
                }
            }
            PsmState::ViewChange => {}
        }
    }

    /// Inbound commit
    pub fn on_commit<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>, commit: PbftCommit) {
        if commit.view < self.current_view {
            debug!(
                target: "quorum::psm",
                view = commit.view,
                current_view = self.current_view,
                "ignoring stale commit"
            );
            return;
        }
        match self.state {
            PsmState::Committed => db.add_pbft_commit(commit),
            PsmState::Prepared { .. } => {
                db.add_pbft_commit(commit);
                self.try_finish_commit(db);
            }
            PsmState::ViewChange => {
                debug!(target: "quorum::psm", "ignoring commit during view change");
            }
        }
    }

    /// Send or re-send this node's commit
    pub fn send_commit<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        if !matches!(self.state, PsmState::Prepared { .. }) {
            return;
        }
        let cached = self.commits_cache.take();
        self.commits_cache =
            db.send_and_add_pbft_commit(cached.as_ref(), self.current_view).or(cached);
        self.try_finish_commit(db);
    }

    /// Inbound view change
    pub fn on_view_change<C: PbftChain>(
        &mut self,
        db: &mut PbftDatabase<C>,
        view_change: PbftViewChange,
    ) {
        if view_change.target_view <= self.current_view {
            debug!(
                target: "quorum::psm",
                target_view = view_change.target_view,
                current_view = self.current_view,
                "ignoring stale view change"
            );
            return;
        }
        if view_change.target_view - self.current_view > MAX_VIEW_DISTANCE {
            debug!(
                target: "quorum::psm",
                target_view = view_change.target_view,
                current_view = self.current_view,
                "ignoring view change too far ahead"
            );
            return;
        }
        match self.state {
            PsmState::Committed | PsmState::Prepared { .. } => {
                if db.should_stop_view_change(&view_change) {
                    debug!(
                        target: "quorum::psm",
                        "ignoring view change behind the local stable checkpoint"
                    );
                    return;
                }
                db.add_pbft_view_change(view_change);
                let target = db.should_view_change(self.current_view);
                if target > self.current_view {
                    self.target_view = target;
                    self.transit_to_view_change(db);
                }
            }
            PsmState::ViewChange => {
                if self.abandon_stale_view_change(db) {
                    return;
                }
                if db.should_stop_view_change(&view_change) {
                    debug!(
                        target: "quorum::psm",
                        "ignoring view change behind the local stable checkpoint"
                    );
                    return;
                }
                db.add_pbft_view_change(view_change);
                self.try_new_view(db);
            }
        }
    }

    /// View-change timer expired
    pub fn send_view_change<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        match self.state {
            PsmState::Committed | PsmState::Prepared { .. } => self.transit_to_view_change(db),
            PsmState::ViewChange => {
                if !self.abandon_stale_view_change(db) {
                    self.send_view_change_with_backoff(db);
                }
            }
        }
    }

    /// Re-broadcast the cached view change, if any
    pub fn resend_view_change<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        if let Some(cached) = self.view_changes_cache.take() {
            let (current_view, target_view) = (self.current_view, self.target_view);
            self.view_changes_cache = db
                .send_and_add_pbft_view_change(Some(&cached), None, current_view, target_view)
                .or(Some(cached));
        }
    }

    /// Inbound new view. Only a new view for a higher view that validates is applied.
    pub fn on_new_view<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>, new_view: PbftNewView) {
        if new_view.view <= self.current_view {
            debug!(
                target: "quorum::psm",
                view = new_view.view,
                current_view = self.current_view,
                "ignoring stale new view"
            );
            return;
        }
        if new_view.view - self.current_view > MAX_VIEW_DISTANCE {
            debug!(
                target: "quorum::psm",
                view = new_view.view,
                current_view = self.current_view,
                "ignoring new view too far ahead"
            );
            return;
        }
        let expected = db.get_new_view_primary_key(new_view.view);
        if let Err(err) = db.validate_new_view(&new_view, expected) {
            warn!(target: "quorum::psm", view = new_view.view, %err, "rejecting new view");
            return;
        }
        self.transit_to_new_view(db, new_view);
    }

    // --- transitions ---

    /// With a commit quorum, request the local commit; once the chain applied it, checkpoint
    /// and start the next round.
    fn try_finish_commit<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        let PsmState::Prepared { pending_commit_local } = self.state else { return };
        if !pending_commit_local && db.should_committed() {
            db.commit_local();
            self.state = PsmState::Prepared { pending_commit_local: true };
        }
        if self.state == (PsmState::Prepared { pending_commit_local: true }) &&
            !db.pending_pbft_lib()
        {
            db.send_pbft_checkpoint();
            self.transit_to_committed(db, false);
        }
    }

    /// Back to committed when this node's own view change claims a stable checkpoint the
    /// local chain has already moved past.
    fn abandon_stale_view_change<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) -> bool {
        let stale =
            self.view_changes_cache.as_ref().is_some_and(|own| db.should_stop_view_change(own));
        if stale {
            info!(
                target: "quorum::psm",
                current_view = self.current_view,
                "abandoning view change behind the local stable checkpoint"
            );
            self.transit_to_committed(db, false);
        }
        stale
    }

    /// As primary of the target view with a view-change quorum, propose the new view.
    fn try_new_view<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        let target = self.target_view;
        if !db.should_new_view(target) || !db.is_new_primary(target) {
            return;
        }
        let Some(certificate) = db.generate_view_changed_certificate(target) else { return };
        self.view_changed_certificate = Some(certificate);

        // a quorum for a higher view supersedes this one
        let proposed = db.get_proposed_new_view_num();
        if proposed != target {
            debug!(target: "quorum::psm", target_view = target, proposed, "not proposing new view");
            return;
        }
        let Some(new_view) = db.send_pbft_new_view(self.view_changed_certificate.as_ref(), target)
        else {
            return;
        };
        self.on_new_view(db, new_view);
    }

    /// View change with exponential backoff: the same target is retried
    /// `2^(target_view - current_view - 1)` times before the target moves up.
    fn send_view_change_with_backoff<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        let distance = self.target_view.saturating_sub(self.current_view).saturating_sub(1);
        let limit = 1u64.checked_shl(distance).unwrap_or(u64::MAX);

        if self.target_view_retries == 0 {
            self.send_fresh_view_change(db);
        } else if u64::from(self.target_view_retries) < limit {
            self.resend_view_change(db);
        } else {
            self.target_view = self.target_view.saturating_add(1);
            self.target_view_retries = 0;
            debug!(
                target: "quorum::psm",
                target_view = self.target_view,
                "raising view change target"
            );
            self.send_fresh_view_change(db);
        }
        self.target_view_retries = self.target_view_retries.saturating_add(1);
        self.try_new_view(db);
    }

    fn send_fresh_view_change<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        self.prepared_certificate = db.generate_prepared_certificate();
        self.view_changes_cache = db.send_and_add_pbft_view_change(
            None,
            self.prepared_certificate.clone(),
            self.current_view,
            self.target_view,
        );
    }

    fn transit_to_committed<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>, to_new_view: bool) {
        if !to_new_view {
            let committed_view = db.get_committed_view();
            if committed_view > self.current_view {
                self.current_view = committed_view;
            }
            self.target_view = self.current_view.saturating_add(1);
        }
        self.state = PsmState::Committed;
        self.prepares_cache = None;
        self.commits_cache = None;
        self.view_changes_cache = None;
        self.view_change_timer = 0;
        info!(
            target: "quorum::psm",
            current_view = self.current_view,
            lib = db.chain().last_irreversible_block_num(),
            "transit to committed"
        );
        self.send_prepare(db);
    }

    fn transit_to_prepared<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        self.state = PsmState::Prepared { pending_commit_local: false };
        self.view_changes_cache = None;
        self.view_change_timer = 0;
        info!(target: "quorum::psm", current_view = self.current_view, "transit to prepared");
        self.commits_cache = db.send_and_add_pbft_commit(None, self.current_view);
        self.try_finish_commit(db);
    }

    fn transit_to_view_change<C: PbftChain>(&mut self, db: &mut PbftDatabase<C>) {
        self.state = PsmState::ViewChange;
        self.prepares_cache = None;
        self.commits_cache = None;
        self.view_change_timer = 0;
        self.target_view_retries = 0;
        info!(
            target: "quorum::psm",
            current_view = self.current_view,
            target_view = self.target_view,
            "transit to view change"
        );
        if db.should_send_pbft_msg() {
            self.send_view_change_with_backoff(db);
        }
    }

    fn transit_to_new_view<C: PbftChain>(
        &mut self,
        db: &mut PbftDatabase<C>,
        new_view: PbftNewView,
    ) {
        self.current_view = new_view.view;
        self.target_view = new_view.view.saturating_add(1);
        self.prepares_cache = None;
        self.commits_cache = None;
        self.view_changes_cache = None;
        self.prepared_certificate = None;
        self.view_changed_certificate = None;
        self.view_change_timer = 0;
        self.target_view_retries = 0;
        info!(
            target: "quorum::psm",
            view = new_view.view,
            primary = %new_view.public_key,
            "entering new view"
        );

        db.prune_pbft_index(new_view.view);
        if let Some(stable) = new_view.stable_checkpoint {
            for checkpoint in stable.checkpoints {
                db.add_pbft_checkpoint(checkpoint);
            }
            db.checkpoint_local();
        }
        if let Some(prepared) = new_view.prepared {
            for prepare in prepared.prepares {
                db.add_pbft_prepare(prepare);
            }
        }

        if db.should_prepared() {
            self.transit_to_prepared(db);
        } else {
            self.transit_to_committed(db, true);
        }
    }
}
