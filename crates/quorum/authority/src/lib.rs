//! Quorum Transaction Authorization
//!
//! This crate decides whether a transaction's signatures legally authorize the permission
//! levels its actions declare.
//!
//! # Architecture
//!
//! ```text
//!  Transaction actions ──► AuthorizationManager ──► (permission level, delay) obligations
//!                              │   native action rules       │ ascending (actor, permission)
//!                              │   linked minimum permissions ▼
//!                              │                        AuthorityChecker
//!                              ▼                              │ weighted threshold search
//!                        PermissionStore  ◄───────────────────┘ resolves delegations
//! ```
//!
//! The checker is deterministic: for fixed inputs it returns the same answer and consumes the
//! same keys on every node. Callers may reject transactions that carry keys it never consumed.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod action;
pub mod authority;
pub mod checker;
pub mod config;
pub mod manager;
pub mod permission;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use action::{
    Action, ActionData, CancelDelay, DeleteAuth, LinkAuth, Transaction, UnlinkAuth, UpdateAuth,
};
pub use authority::{
    Authority, InvalidAuthority, KeyWeight, PermissionLevelWeight, WaitWeight, Weight,
};
pub use checker::{noop_checktime, AuthorityChecker};
pub use config::AuthorizationConfig;
pub use manager::AuthorizationManager;
pub use permission::{GeneratedTransaction, Permission, PermissionId, PermissionStore};

use alloy_primitives::B256;
use quorum_primitives::{Name, PermissionLevel, PublicKey};
use thiserror::Error;

/// Authorization errors
#[derive(Debug, Error)]
pub enum AuthorizationError {
    /// Malformed authority
    #[error("invalid authority: {0}")]
    InvalidAuthority(#[from] InvalidAuthority),

    /// Malformed native action or a forbidden link target
    #[error("action validation failed: {0}")]
    ActionValidate(String),

    /// A declared permission level lacks signing weight
    #[error(
        "transaction declares authority '{auth}', but does not have signatures for it under a \
         provided delay of {provided_delay_ms} ms, provided permissions {provided_permissions:?}, \
         provided keys {provided_keys:?}, and a delay max limit of {delay_max_limit_ms} ms"
    )]
    UnsatisfiedAuthorization {
        /// Unsatisfied permission level
        auth: PermissionLevel,
        /// Delay the obligation was checked under
        provided_delay_ms: u128,
        /// Pre-satisfied permission levels
        provided_permissions: Vec<PermissionLevel>,
        /// Provided keys
        provided_keys: Vec<PublicKey>,
        /// Configured maximum transaction delay
        delay_max_limit_ms: u128,
    },

    /// A declared authorization is stronger than needed or shaped wrongly
    #[error("{action} declares irrelevant authority '{auth}'; {requirement}")]
    IrrelevantAuthority {
        /// Action name
        action: Name,
        /// Declared authorization
        auth: PermissionLevel,
        /// What would have been accepted
        requirement: String,
    },

    /// Some provided keys were never used
    #[error("transaction bears irrelevant signatures from these keys: {keys:?}")]
    TxIrrelevantSignature {
        /// Unused keys
        keys: Vec<PublicKey>,
    },

    /// An action declares no authorization at all
    #[error("missing authority for {account}::{action}")]
    MissingAuth {
        /// Contract account
        account: Name,
        /// Action name
        action: Name,
    },

    /// Permission lookup failed
    #[error("failed to retrieve permission: {0}")]
    PermissionQuery(PermissionLevel),

    /// canceldelay references an unknown delayed transaction
    #[error("cannot cancel trx_id={0}, there is no deferred transaction with that transaction id")]
    TransactionNotFound(B256),

    /// Transaction-level failure, such as unlinking a link that does not exist
    #[error("transaction exception: {0}")]
    Transaction(String),

    /// Raised by a checktime callback to abort a long-running check
    #[error("deadline exceeded while checking authorization")]
    Deadline,
}
