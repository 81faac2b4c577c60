//! PBFT messages and certificates
//!
//! Every signed record carries the signer's public key and a signature over a digest of its
//! remaining fields, packed in declaration order and excluding the uuid and the signature. The
//! uuid only serves duplicate suppression when a message is re-broadcast.

use alloy_primitives::{B128, B256};
use quorum_primitives::{now_micros, DigestEncoder, PrivateKey, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// PBFT view number
pub type View = u32;

/// Block height
pub type BlockNum = u32;

/// Message identifier used for idempotent ingestion
pub type Uuid = B128;

/// A fresh random message id
pub fn new_uuid() -> Uuid {
    B128::from(rand::random::<[u8; 16]>())
}

/// A record signed by a single producer key
pub trait SignedMessage {
    /// Digest the signature covers
    fn digest(&self) -> B256;

    /// Signer
    fn public_key(&self) -> &PublicKey;

    /// Current signature
    fn signature(&self) -> &Signature;

    /// Replace the signature
    fn set_signature(&mut self, signature: Signature);

    /// Check the signature against the embedded public key
    fn is_signature_valid(&self) -> bool {
        self.public_key().verify(&self.digest(), self.signature())
    }

    /// Sign with `key`
    fn sign(&mut self, key: &PrivateKey) {
        let signature = key.sign(&self.digest());
        self.set_signature(signature);
    }
}

macro_rules! impl_signed_message {
    ($ty:ty) => {
        impl SignedMessage for $ty {
            fn digest(&self) -> B256 {
                self.digest()
            }

            fn public_key(&self) -> &PublicKey {
                &self.public_key
            }

            fn signature(&self) -> &Signature {
                &self.signature
            }

            fn set_signature(&mut self, signature: Signature) {
                self.signature = signature;
            }
        }
    };
}

/// Vote that a block is prepared in a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftPrepare {
    /// Message id
    pub uuid: Uuid,
    /// View the vote is cast in
    pub view: View,
    /// Prepared block height
    pub block_num: BlockNum,
    /// Prepared block
    pub block_id: B256,
    /// Signer
    pub public_key: PublicKey,
    /// Chain the vote belongs to
    pub chain_id: B256,
    /// Signature over [`Self::digest`]
    pub signature: Signature,
    /// Microseconds timestamp
    pub timestamp: u64,
}

impl PbftPrepare {
    /// Unsigned prepare with a fresh uuid and timestamp
    pub fn new(
        view: View,
        block_num: BlockNum,
        block_id: B256,
        public_key: PublicKey,
        chain_id: B256,
    ) -> Self {
        Self {
            uuid: new_uuid(),
            view,
            block_num,
            block_id,
            public_key,
            chain_id,
            signature: Signature::default(),
            timestamp: now_micros(),
        }
    }

    /// Signed digest
    pub fn digest(&self) -> B256 {
        DigestEncoder::new()
            .u32(self.view)
            .u32(self.block_num)
            .hash(&self.block_id)
            .key(&self.public_key)
            .hash(&self.chain_id)
            .u64(self.timestamp)
            .finish()
    }
}

impl_signed_message!(PbftPrepare);

/// Vote that a prepared block is committed in a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftCommit {
    /// Message id
    pub uuid: Uuid,
    /// View the vote is cast in
    pub view: View,
    /// Committed block height
    pub block_num: BlockNum,
    /// Committed block
    pub block_id: B256,
    /// Signer
    pub public_key: PublicKey,
    /// Chain the vote belongs to
    pub chain_id: B256,
    /// Signature over [`Self::digest`]
    pub signature: Signature,
    /// Microseconds timestamp
    pub timestamp: u64,
}

impl PbftCommit {
    /// Unsigned commit with a fresh uuid and timestamp
    pub fn new(
        view: View,
        block_num: BlockNum,
        block_id: B256,
        public_key: PublicKey,
        chain_id: B256,
    ) -> Self {
        Self {
            uuid: new_uuid(),
            view,
            block_num,
            block_id,
            public_key,
            chain_id,
            signature: Signature::default(),
            timestamp: now_micros(),
        }
    }

    /// Signed digest
    pub fn digest(&self) -> B256 {
        DigestEncoder::new()
            .u32(self.view)
            .u32(self.block_num)
            .hash(&self.block_id)
            .key(&self.public_key)
            .hash(&self.chain_id)
            .u64(self.timestamp)
            .finish()
    }
}

impl_signed_message!(PbftCommit);

/// Claim that a committed block is a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftCheckpoint {
    /// Message id
    pub uuid: Uuid,
    /// Checkpoint height
    pub block_num: BlockNum,
    /// Checkpoint block
    pub block_id: B256,
    /// Signer
    pub public_key: PublicKey,
    /// Chain the checkpoint belongs to
    pub chain_id: B256,
    /// Signature over [`Self::digest`]
    pub signature: Signature,
    /// Microseconds timestamp
    pub timestamp: u64,
}

impl PbftCheckpoint {
    /// Unsigned checkpoint with a fresh uuid and timestamp
    pub fn new(block_num: BlockNum, block_id: B256, public_key: PublicKey, chain_id: B256) -> Self {
        Self {
            uuid: new_uuid(),
            block_num,
            block_id,
            public_key,
            chain_id,
            signature: Signature::default(),
            timestamp: now_micros(),
        }
    }

    /// Signed digest
    pub fn digest(&self) -> B256 {
        DigestEncoder::new()
            .u32(self.block_num)
            .hash(&self.block_id)
            .key(&self.public_key)
            .hash(&self.chain_id)
            .u64(self.timestamp)
            .finish()
    }
}

impl_signed_message!(PbftCheckpoint);

/// A checkpoint backed by a quorum of checkpoint messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftStableCheckpoint {
    /// Checkpoint height
    pub block_num: BlockNum,
    /// Checkpoint block
    pub block_id: B256,
    /// Supporting checkpoint messages
    pub checkpoints: Vec<PbftCheckpoint>,
    /// Chain the checkpoint belongs to
    pub chain_id: B256,
}

impl PbftStableCheckpoint {
    /// Digest over the checkpoint and its supporting messages
    pub fn digest(&self) -> B256 {
        let mut enc = DigestEncoder::new()
            .u32(self.block_num)
            .hash(&self.block_id)
            .count(self.checkpoints.len());
        for checkpoint in &self.checkpoints {
            enc = enc.nested(&checkpoint.digest()).signature(&checkpoint.signature);
        }
        enc.hash(&self.chain_id).finish()
    }
}

/// Proof that a block gathered a prepare quorum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftPreparedCertificate {
    /// Prepared block
    pub block_id: B256,
    /// Prepared block height
    pub block_num: BlockNum,
    /// Quorum of prepares from a single view
    pub prepares: Vec<PbftPrepare>,
    /// Aggregator
    pub public_key: PublicKey,
    /// Aggregator signature over [`Self::digest`]
    pub signature: Signature,
}

impl PbftPreparedCertificate {
    /// Signed digest
    pub fn digest(&self) -> B256 {
        let mut enc = DigestEncoder::new()
            .hash(&self.block_id)
            .u32(self.block_num)
            .count(self.prepares.len());
        for prepare in &self.prepares {
            enc = enc.nested(&prepare.digest()).signature(&prepare.signature);
        }
        enc.key(&self.public_key).finish()
    }
}

impl_signed_message!(PbftPreparedCertificate);

/// Request to move from `current_view` to `target_view`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftViewChange {
    /// Message id
    pub uuid: Uuid,
    /// Sender's current view
    pub current_view: View,
    /// View the sender wants to move to
    pub target_view: View,
    /// Sender's highest prepared certificate
    pub prepared: Option<PbftPreparedCertificate>,
    /// Sender's last stable checkpoint
    pub stable_checkpoint: Option<PbftStableCheckpoint>,
    /// Signer
    pub public_key: PublicKey,
    /// Chain the request belongs to
    pub chain_id: B256,
    /// Signature over [`Self::digest`]
    pub signature: Signature,
    /// Microseconds timestamp
    pub timestamp: u64,
}

impl PbftViewChange {
    /// Unsigned view change with a fresh uuid and timestamp
    pub fn new(
        current_view: View,
        target_view: View,
        prepared: Option<PbftPreparedCertificate>,
        stable_checkpoint: Option<PbftStableCheckpoint>,
        public_key: PublicKey,
        chain_id: B256,
    ) -> Self {
        Self {
            uuid: new_uuid(),
            current_view,
            target_view,
            prepared,
            stable_checkpoint,
            public_key,
            chain_id,
            signature: Signature::default(),
            timestamp: now_micros(),
        }
    }

    /// Height of the embedded stable checkpoint, 0 when absent
    pub fn stable_checkpoint_num(&self) -> BlockNum {
        self.stable_checkpoint.as_ref().map_or(0, |scp| scp.block_num)
    }

    /// Signed digest
    pub fn digest(&self) -> B256 {
        DigestEncoder::new()
            .u32(self.current_view)
            .u32(self.target_view)
            .nested(&optional_digest(self.prepared.as_ref().map(PbftPreparedCertificate::digest)))
            .nested(&optional_digest(
                self.stable_checkpoint.as_ref().map(PbftStableCheckpoint::digest),
            ))
            .key(&self.public_key)
            .hash(&self.chain_id)
            .u64(self.timestamp)
            .finish()
    }
}

impl_signed_message!(PbftViewChange);

/// Proof that a view gathered a view-change quorum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftViewChangedCertificate {
    /// Target view
    pub view: View,
    /// View changes for `view`
    pub view_changes: Vec<PbftViewChange>,
    /// Aggregator
    pub public_key: PublicKey,
    /// Aggregator signature over [`Self::digest`]
    pub signature: Signature,
}

impl PbftViewChangedCertificate {
    /// Signed digest
    pub fn digest(&self) -> B256 {
        let mut enc = DigestEncoder::new().u32(self.view).count(self.view_changes.len());
        for view_change in &self.view_changes {
            enc = enc.nested(&view_change.digest()).signature(&view_change.signature);
        }
        enc.key(&self.public_key).finish()
    }
}

impl_signed_message!(PbftViewChangedCertificate);

/// The new primary's announcement of a view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PbftNewView {
    /// Message id
    pub uuid: Uuid,
    /// The new view
    pub view: View,
    /// Highest valid prepared certificate among the view changes
    pub prepared: Option<PbftPreparedCertificate>,
    /// Highest valid stable checkpoint among the view changes
    pub stable_checkpoint: Option<PbftStableCheckpoint>,
    /// View-change quorum for `view`
    pub view_changed: PbftViewChangedCertificate,
    /// Primary of `view`
    pub public_key: PublicKey,
    /// Chain the announcement belongs to
    pub chain_id: B256,
    /// Signature over [`Self::digest`]
    pub signature: Signature,
    /// Microseconds timestamp
    pub timestamp: u64,
}

impl PbftNewView {
    /// Unsigned new view with a fresh uuid and timestamp
    pub fn new(
        view: View,
        prepared: Option<PbftPreparedCertificate>,
        stable_checkpoint: Option<PbftStableCheckpoint>,
        view_changed: PbftViewChangedCertificate,
        public_key: PublicKey,
        chain_id: B256,
    ) -> Self {
        Self {
            uuid: new_uuid(),
            view,
            prepared,
            stable_checkpoint,
            view_changed,
            public_key,
            chain_id,
            signature: Signature::default(),
            timestamp: now_micros(),
        }
    }

    /// Signed digest
    pub fn digest(&self) -> B256 {
        DigestEncoder::new()
            .u32(self.view)
            .nested(&optional_digest(self.prepared.as_ref().map(PbftPreparedCertificate::digest)))
            .nested(&optional_digest(
                self.stable_checkpoint.as_ref().map(PbftStableCheckpoint::digest),
            ))
            .nested(&self.view_changed.digest())
            .key(&self.public_key)
            .hash(&self.chain_id)
            .u64(self.timestamp)
            .finish()
    }
}

impl_signed_message!(PbftNewView);

/// Absent certificates digest as zero.
fn optional_digest(digest: Option<B256>) -> B256 {
    digest.unwrap_or_default()
}

/// Any PBFT wire message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "msg", rename_all = "snake_case")]
pub enum PbftMessage {
    /// [`PbftPrepare`]
    Prepare(PbftPrepare),
    /// [`PbftCommit`]
    Commit(PbftCommit),
    /// [`PbftCheckpoint`]
    Checkpoint(PbftCheckpoint),
    /// [`PbftViewChange`]
    ViewChange(PbftViewChange),
    /// [`PbftNewView`]
    NewView(PbftNewView),
}

impl PbftMessage {
    /// Signer of the message
    pub fn public_key(&self) -> &PublicKey {
        match self {
            Self::Prepare(msg) => &msg.public_key,
            Self::Commit(msg) => &msg.public_key,
            Self::Checkpoint(msg) => &msg.public_key,
            Self::ViewChange(msg) => &msg.public_key,
            Self::NewView(msg) => &msg.public_key,
        }
    }

    /// Short message kind, for logs
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Prepare(_) => "prepare",
            Self::Commit(_) => "commit",
            Self::Checkpoint(_) => "checkpoint",
            Self::ViewChange(_) => "view_change",
            Self::NewView(_) => "new_view",
        }
    }
}
