//! secp256k1 keys and signatures
//!
//! Public keys are carried as 33-byte compressed SEC1 points so that they order by their raw
//! bytes, which is the order authorities store their key lists in.

use alloy_primitives::{B256, FixedBytes};
use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature as EcdsaSignature, SigningKey, VerifyingKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Key handling errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The secret scalar is zero or out of range
    #[error("invalid private key")]
    InvalidPrivateKey,
}

/// Compressed secp256k1 public key.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub FixedBytes<33>);

impl PublicKey {
    /// Verify `signature` over `digest`. Malformed keys or signatures simply fail verification.
    pub fn verify(&self, digest: &B256, signature: &Signature) -> bool {
        let Ok(key) = VerifyingKey::from_sec1_bytes(self.0.as_slice()) else {
            return false;
        };
        let Ok(signature) = EcdsaSignature::from_slice(signature.0.as_slice()) else {
            return false;
        };
        key.verify(digest.as_slice(), &signature).is_ok()
    }

    /// Returns true for the all-zero placeholder key.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first bytes are enough to tell keys apart in logs
        write!(f, "PublicKey({}..)", &self.0.to_string()[..12])
    }
}

/// Compact 64-byte ECDSA signature (r || s).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub FixedBytes<64>);

/// A secp256k1 signing key.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Build a key from 32 secret bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        SigningKey::from_slice(bytes).map(Self).map_err(|_| CryptoError::InvalidPrivateKey)
    }

    /// Deterministically derive a key from a seed (test networks, simulations).
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        let mut material: [u8; 32] = hasher.finalize().into();
        loop {
            if let Ok(key) = Self::from_bytes(&material) {
                return key;
            }
            // astronomically unlikely: rehash until the scalar is in range
            material = Sha256::digest(material).into();
        }
    }

    /// Generate a fresh random key.
    pub fn random() -> Self {
        loop {
            if let Ok(key) = Self::from_bytes(&rand::random::<[u8; 32]>()) {
                return key;
            }
        }
    }

    /// The compressed public key.
    pub fn public_key(&self) -> PublicKey {
        let point = self.0.verifying_key().to_encoded_point(true);
        PublicKey(FixedBytes::from_slice(point.as_bytes()))
    }

    /// Sign a message digest.
    pub fn sign(&self, digest: &B256) -> Signature {
        let signature: EcdsaSignature = self.0.sign(digest.as_slice());
        Signature(FixedBytes::from_slice(&signature.to_bytes()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey").field(&self.public_key()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = PrivateKey::from_seed(b"producer-1");
        let digest = B256::repeat_byte(7);
        let signature = key.sign(&digest);

        assert!(key.public_key().verify(&digest, &signature));
        assert!(!key.public_key().verify(&B256::repeat_byte(8), &signature));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = PrivateKey::from_seed(b"a");
        let b = PrivateKey::from_seed(b"b");
        let digest = B256::repeat_byte(1);
        assert!(!b.public_key().verify(&digest, &a.sign(&digest)));
    }

    #[test]
    fn test_seeded_keys_are_deterministic() {
        assert_eq!(
            PrivateKey::from_seed(b"x").public_key(),
            PrivateKey::from_seed(b"x").public_key()
        );
        assert_ne!(
            PrivateKey::from_seed(b"x").public_key(),
            PrivateKey::from_seed(b"y").public_key()
        );
    }

    #[test]
    fn test_zero_key_never_verifies() {
        let key = PublicKey::default();
        assert!(key.is_zero());
        assert!(!key.verify(&B256::ZERO, &Signature::default()));
    }
}
