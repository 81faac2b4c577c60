//! Packed message digests
//!
//! Signed messages hash their fields in declaration order, little-endian, skipping the uuid and
//! the signature itself. Nodes only agree on a signature if they agree on this layout, so field
//! order here is a wire-compatibility constraint.

use crate::{Name, PublicKey, Signature};
use alloy_primitives::B256;
use sha2::{Digest, Sha256};

/// Incremental SHA-256 encoder over packed fields.
#[derive(Debug, Clone, Default)]
pub struct DigestEncoder {
    hasher: Sha256,
}

impl DigestEncoder {
    /// Start a new digest
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a little-endian `u32`
    pub fn u32(mut self, value: u32) -> Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    /// Append a little-endian `u64`
    pub fn u64(mut self, value: u64) -> Self {
        self.hasher.update(value.to_le_bytes());
        self
    }

    /// Append a 32-byte hash
    pub fn hash(mut self, value: &B256) -> Self {
        self.hasher.update(value.as_slice());
        self
    }

    /// Append a compressed public key
    pub fn key(mut self, key: &PublicKey) -> Self {
        self.hasher.update(key.0.as_slice());
        self
    }

    /// Append a signature (used when a certificate embeds signed messages)
    pub fn signature(mut self, signature: &Signature) -> Self {
        self.hasher.update(signature.0.as_slice());
        self
    }

    /// Append a length-prefixed name
    pub fn name(mut self, name: &Name) -> Self {
        self.hasher.update((name.as_str().len() as u32).to_le_bytes());
        self.hasher.update(name.as_str().as_bytes());
        self
    }

    /// Append an already computed digest of a nested structure
    pub fn nested(self, digest: &B256) -> Self {
        self.hash(digest)
    }

    /// Append a collection length
    pub fn count(self, len: usize) -> Self {
        self.u32(len as u32)
    }

    /// Finish and return the digest
    pub fn finish(self) -> B256 {
        B256::from_slice(&self.hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_order_matters() {
        let a = DigestEncoder::new().u32(1).u64(2).finish();
        let b = DigestEncoder::new().u64(2).u32(1).finish();
        assert_ne!(a, b);
    }

    #[test]
    fn test_same_fields_same_digest() {
        let id = B256::repeat_byte(3);
        let a = DigestEncoder::new().u32(5).hash(&id).finish();
        let b = DigestEncoder::new().u32(5).hash(&id).finish();
        assert_eq!(a, b);
    }
}
