//! Actions, transactions and the native authorization payloads

use crate::Authority;
use alloy_primitives::B256;
use quorum_primitives::{Name, PermissionLevel};
use serde::{Deserialize, Serialize};

/// Create or replace a permission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAuth {
    /// Account owning the permission
    pub account: Name,
    /// Permission being created or updated
    pub permission: Name,
    /// Parent permission; consulted when the permission does not exist yet
    pub parent: Name,
    /// New authority
    pub auth: Authority,
}

/// Remove a permission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAuth {
    /// Account owning the permission
    pub account: Name,
    /// Permission to delete
    pub permission: Name,
}

/// Require `requirement` for `code::type` actions authorized by `account`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAuth {
    /// Authorizing account
    pub account: Name,
    /// Contract
    pub code: Name,
    /// Action name, empty for a contract-wide default
    #[serde(rename = "type")]
    pub action_type: Name,
    /// Minimum permission to require
    pub requirement: Name,
}

/// Remove a link created by [`LinkAuth`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkAuth {
    /// Authorizing account
    pub account: Name,
    /// Contract
    pub code: Name,
    /// Action name
    #[serde(rename = "type")]
    pub action_type: Name,
}

/// Cancel a delayed transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDelay {
    /// One of the delayed transaction's declared authorizations
    pub canceling_auth: PermissionLevel,
    /// Delayed transaction id
    pub trx_id: B256,
}

/// Decoded action payload.
///
/// Only the native authorization actions are interpreted; everything else stays opaque.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ActionData {
    /// `eosio::updateauth`
    UpdateAuth(UpdateAuth),
    /// `eosio::deleteauth`
    DeleteAuth(DeleteAuth),
    /// `eosio::linkauth`
    LinkAuth(LinkAuth),
    /// `eosio::unlinkauth`
    UnlinkAuth(UnlinkAuth),
    /// `eosio::canceldelay`
    CancelDelay(CancelDelay),
    /// Contract-defined payload
    Raw(Vec<u8>),
}

/// A contract call together with the permissions it declares.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Contract account
    pub account: Name,
    /// Action name
    pub name: Name,
    /// Declared authorizations
    pub authorization: Vec<PermissionLevel>,
    /// Payload
    pub data: ActionData,
}

impl Action {
    /// A contract action with an opaque payload.
    pub fn new(
        account: impl Into<Name>,
        name: impl Into<Name>,
        authorization: Vec<PermissionLevel>,
    ) -> Self {
        Self {
            account: account.into(),
            name: name.into(),
            authorization,
            data: ActionData::Raw(Vec::new()),
        }
    }

    /// A native `eosio` action with a decoded payload.
    pub fn native(data: ActionData, authorization: Vec<PermissionLevel>) -> Self {
        let name = match &data {
            ActionData::UpdateAuth(_) => Name::UPDATEAUTH,
            ActionData::DeleteAuth(_) => Name::DELETEAUTH,
            ActionData::LinkAuth(_) => Name::LINKAUTH,
            ActionData::UnlinkAuth(_) => Name::UNLINKAUTH,
            ActionData::CancelDelay(_) => Name::CANCELDELAY,
            ActionData::Raw(_) => Name::empty(),
        };
        Self { account: Name::SYSTEM, name, authorization, data }
    }
}

/// Returns true for the native actions whose authorization is checked by bespoke rules and
/// which can never be the target of a permission link.
pub fn is_native_authorization_action(name: &Name) -> bool {
    [Name::UPDATEAUTH, Name::DELETEAUTH, Name::LINKAUTH, Name::UNLINKAUTH, Name::CANCELDELAY]
        .contains(name)
}

/// An ordered list of actions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Actions in execution order
    pub actions: Vec<Action>,
}
