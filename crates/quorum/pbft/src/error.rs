//! PBFT errors

use crate::View;
use alloy_primitives::B256;
use quorum_primitives::PublicKey;
use thiserror::Error;

/// PBFT errors
///
/// Protocol errors reject a single message; the state machine logs and drops them.
#[derive(Debug, Error)]
pub enum PbftError {
    /// Message for another chain
    #[error("message for chain {got}, expected {expected}")]
    WrongChain {
        /// Local chain id
        expected: B256,
        /// Chain id carried by the message
        got: B256,
    },

    /// New view not signed by the primary of its view
    #[error("new view signed by {got}, expected primary {expected:?}")]
    UnexpectedPrimary {
        /// Primary of the view, if the schedule has one
        expected: Option<PublicKey>,
        /// Signer of the new view
        got: PublicKey,
    },

    /// Signature does not verify
    #[error("invalid signature from {0}")]
    InvalidSignature(PublicKey),

    /// New view and its view-changed certificate disagree on the view
    #[error("new view {view} carries a certificate for view {certificate_view}")]
    TargetViewMismatch {
        /// View of the new view
        view: View,
        /// View of the embedded certificate
        certificate_view: View,
    },

    /// Not enough scheduled producers requested the view change
    #[error("view changes from {count} scheduled producers, {threshold} required")]
    InsufficientViewChanges {
        /// Valid view changes from scheduled producers
        count: usize,
        /// Quorum
        threshold: usize,
    },

    /// Local view-change quorum for the view is missing
    #[error("view {0} has not gathered a view-change quorum")]
    NotViewChanged(View),

    /// Embedded prepared certificate is not the highest valid one
    #[error("prepared certificate does not match the view changes")]
    PreparedCertificateMismatch,

    /// Embedded stable checkpoint is not the highest valid one
    #[error("stable checkpoint does not match the view changes")]
    StableCheckpointMismatch,

    /// Persisted view file is shorter than a view number
    #[error("corrupt view file: {0} bytes")]
    CorruptViewFile(usize),

    /// Rejected configuration value
    #[error("invalid pbft config: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed
    #[error("failed to parse pbft config: {0}")]
    Config(#[from] serde_json::Error),

    /// Persistence I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PbftError {
    /// Check if the error rejects a single message rather than the node setup
    pub fn is_protocol_error(&self) -> bool {
        !matches!(
            self,
            Self::CorruptViewFile(_) | Self::InvalidConfig(_) | Self::Config(_) | Self::Io(_)
        )
    }
}
