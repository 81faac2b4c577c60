//! PBFT finality for scheduled block producers
//!
//! Producers run a three-phase agreement on top of an externally produced chain:
//!
//! ```text
//!  prepare(view, block) ──2f+1──► prepared ──commit──2f+1──► committed ──► LIB advances
//!                                                                   │
//!  every `checkpoint_interval` blocks:  checkpoint ──2f+1──► stable checkpoint
//!
//!  no progress for `view_change_timeout` ticks, or f+1 peers asking:
//!      view_change(target) ──2f+1──► primary(target) sends new_view ──► target becomes current
//! ```
//!
//! With `N` scheduled producers the engine tolerates `f = (N - 1) / 3` faulty ones. The chain
//! itself stays external behind [`PbftChain`]; messages leave and enter through
//! [`PbftSignals`]. Everything runs on the caller's thread: [`PbftController`] is driven by
//! inbound messages and a periodic [`PbftController::tick`].

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod chain;
pub mod config;
pub mod controller;
pub mod database;
pub mod error;
pub mod message;
pub mod producer;
pub mod signals;
pub mod state_machine;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use chain::{BlockInfo, PbftChain};
pub use config::{PbftConfig, PBFT_DB_FILENAME};
pub use controller::PbftController;
pub use database::{BlockRef, PbftCheckpointState, PbftDatabase, PbftState, PbftViewState};
pub use error::PbftError;
pub use message::{
    new_uuid, BlockNum, PbftCheckpoint, PbftCommit, PbftMessage, PbftNewView, PbftPrepare,
    PbftPreparedCertificate, PbftStableCheckpoint, PbftViewChange, PbftViewChangedCertificate,
    SignedMessage, Uuid, View,
};
pub use producer::{ProducerKey, ProducerSchedule};
pub use signals::PbftSignals;
pub use state_machine::{PsmMachine, PsmState, MAX_VIEW_DISTANCE};
