//! PBFT controller
//!
//! Entry point the chain-processing thread drives: inbound messages through `on_pbft_*`, and
//! once per production attempt through [`PbftController::tick`]. The current view survives
//! restarts through a little-endian `u32` in [`PbftConfig::view_file`].

use crate::{
    PbftChain, PbftCheckpoint, PbftCommit, PbftConfig, PbftDatabase, PbftError, PbftMessage,
    PbftNewView, PbftPrepare, PbftSignals, PbftViewChange, PsmMachine, PsmState, View,
};
use quorum_primitives::PrivateKey;
use std::{fs, io, path::Path};
use tracing::{debug, info, warn};

/// Owns the PBFT database and state machine of one node
#[derive(Debug)]
pub struct PbftController<C: PbftChain> {
    config: PbftConfig,
    db: PbftDatabase<C>,
    machine: PsmMachine,
}

impl<C: PbftChain> PbftController<C> {
    /// Create a controller, resuming the view persisted by the previous clean shutdown.
    ///
    /// The view file is consumed: a crash before the next shutdown restarts from view 0.
    pub fn new(
        config: PbftConfig,
        chain: C,
        signer: Option<PrivateKey>,
        signals: PbftSignals,
    ) -> Result<Self, PbftError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let current_view = take_persisted_view(&config.view_file())?.unwrap_or(0);
        info!(
            target: "quorum::pbft",
            current_view,
            data_dir = %config.data_dir.display(),
            "starting pbft controller"
        );

        let db = PbftDatabase::new(chain, signer, signals, config.checkpoint_interval);
        Ok(Self { config, db, machine: PsmMachine::new(current_view) })
    }

    /// Configuration
    pub const fn config(&self) -> &PbftConfig {
        &self.config
    }

    /// The message database
    pub const fn database(&self) -> &PbftDatabase<C> {
        &self.db
    }

    /// Mutable access to the message database
    pub fn database_mut(&mut self) -> &mut PbftDatabase<C> {
        &mut self.db
    }

    /// The state machine
    pub const fn machine(&self) -> &PsmMachine {
        &self.machine
    }

    /// Current phase
    pub const fn state(&self) -> PsmState {
        self.machine.state()
    }

    /// Current view
    pub const fn current_view(&self) -> View {
        self.machine.current_view()
    }

    /// View this node is moving to
    pub const fn target_view(&self) -> View {
        self.machine.target_view()
    }

    fn should_send(&self) -> bool {
        self.config.bp_candidate && self.db.should_send_pbft_msg()
    }

    /// Drive one round of outbound traffic and the view-change timer
    pub fn tick(&mut self) {
        self.maybe_pbft_prepare();
        self.maybe_pbft_commit();
        self.maybe_pbft_view_change();
        self.send_pbft_checkpoint();
    }

    /// Send or re-send this node's prepare
    pub fn maybe_pbft_prepare(&mut self) {
        if self.should_send() {
            self.machine.send_prepare(&mut self.db);
        }
    }

    /// Send or re-send this node's commit
    pub fn maybe_pbft_commit(&mut self) {
        if self.should_send() {
            self.machine.send_commit(&mut self.db);
        }
    }

    /// Advance the view-change timer; on expiry start or continue a view change
    pub fn maybe_pbft_view_change(&mut self) {
        if !self.should_send() {
            return;
        }
        if self.machine.view_change_timer() <= self.config.view_change_timeout {
            self.machine.resend_view_change(&mut self.db);
            self.machine.tick_view_change_timer();
        } else {
            debug!(
                target: "quorum::pbft",
                current_view = self.current_view(),
                "view change timer expired"
            );
            self.machine.reset_view_change_timer();
            self.machine.send_view_change(&mut self.db);
        }
    }

    /// Sign outstanding checkpoints
    pub fn send_pbft_checkpoint(&mut self) {
        if self.should_send() {
            self.db.send_pbft_checkpoint();
        }
    }

    /// Inbound prepare
    pub fn on_pbft_prepare(&mut self, prepare: PbftPrepare) {
        if !self.config.bp_candidate {
            return;
        }
        self.db.signals().emit_incoming(PbftMessage::Prepare(prepare.clone()));
        self.machine.on_prepare(&mut self.db, prepare);
    }

    /// Inbound commit
    pub fn on_pbft_commit(&mut self, commit: PbftCommit) {
        if !self.config.bp_candidate {
            return;
        }
        self.db.signals().emit_incoming(PbftMessage::Commit(commit.clone()));
        self.machine.on_commit(&mut self.db, commit);
    }

    /// Inbound view change
    pub fn on_pbft_view_change(&mut self, view_change: PbftViewChange) {
        if !self.config.bp_candidate {
            return;
        }
        self.db.signals().emit_incoming(PbftMessage::ViewChange(view_change.clone()));
        self.machine.on_view_change(&mut self.db, view_change);
    }

    /// Inbound new view
    pub fn on_pbft_new_view(&mut self, new_view: PbftNewView) {
        if !self.config.bp_candidate {
            return;
        }
        self.db.signals().emit_incoming(PbftMessage::NewView(new_view.clone()));
        self.machine.on_new_view(&mut self.db, new_view);
    }

    /// Inbound checkpoint; a new checkpoint quorum advances the local stable checkpoint
    pub fn on_pbft_checkpoint(&mut self, checkpoint: PbftCheckpoint) {
        if !self.config.bp_candidate {
            return;
        }
        self.db.signals().emit_incoming(PbftMessage::Checkpoint(checkpoint.clone()));
        if !self.db.is_valid_checkpoint(&checkpoint) {
            debug!(
                target: "quorum::pbft",
                block_num = checkpoint.block_num,
                signer = %checkpoint.public_key,
                "dropping checkpoint"
            );
            return;
        }
        self.db.add_pbft_checkpoint(checkpoint);
        self.db.checkpoint_local();
    }

    /// Dispatch any inbound message
    pub fn on_message(&mut self, msg: PbftMessage) {
        match msg {
            PbftMessage::Prepare(msg) => self.on_pbft_prepare(msg),
            PbftMessage::Commit(msg) => self.on_pbft_commit(msg),
            PbftMessage::Checkpoint(msg) => self.on_pbft_checkpoint(msg),
            PbftMessage::ViewChange(msg) => self.on_pbft_view_change(msg),
            PbftMessage::NewView(msg) => self.on_pbft_new_view(msg),
        }
    }

    /// Write the current view to the view file
    pub fn persist_view(&self) -> Result<(), PbftError> {
        fs::write(self.config.view_file(), self.current_view().to_le_bytes())?;
        Ok(())
    }
}

impl<C: PbftChain> Drop for PbftController<C> {
    fn drop(&mut self) {
        if let Err(err) = self.persist_view() {
            warn!(target: "quorum::pbft", %err, "failed to persist pbft view");
        }
    }
}

/// Read and remove the persisted view. A missing file means no view was saved.
fn take_persisted_view(path: &Path) -> Result<Option<View>, PbftError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let Some(view) = bytes.first_chunk::<4>().copied().map(View::from_le_bytes) else {
        return Err(PbftError::CorruptViewFile(bytes.len()));
    };
    fs::remove_file(path)?;
    Ok(Some(view))
}
