//! Quorum shared primitives
//!
//! Types shared by the authorization checker and the PBFT finality engine:
//!
//! - [`Name`]: an account, permission or action name
//! - [`PermissionLevel`]: an `(actor, permission)` pair
//! - [`PublicKey`] / [`Signature`] / [`PrivateKey`]: secp256k1 producer and account keys
//! - [`DigestEncoder`]: the packed little-endian encoder every signed message digest uses

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod crypto;
pub mod digest;
pub mod name;

pub use crypto::{CryptoError, PrivateKey, PublicKey, Signature};
pub use digest::DigestEncoder;
pub use name::{Name, PermissionLevel};

/// Re-export of the 32-byte hash type used for block ids, chain ids and digests.
pub use alloy_primitives::B256;

/// Microseconds since the unix epoch.
pub fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic_enough() {
        let a = now_micros();
        let b = now_micros();
        assert!(a > 0);
        assert!(b >= a);
    }
}
