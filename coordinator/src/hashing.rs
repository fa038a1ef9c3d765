//! Hash-engine seam.
//!
//! The coordinator never mines; it only re-checks worker-submitted results
//! when `shares.validate_hashes` is on. The actual proof-of-work algorithm
//! lives behind [`HashEngine`] so the native binding can be slotted in
//! without touching the pipeline.

use sha3::{Digest, Sha3_256};

pub trait HashEngine: Send + Sync {
    /// Hash a work blob with the given nonce spliced in.
    fn hash(&self, blob: &[u8], nonce: u32) -> [u8; 32];
}

/// Default engine: SHA3-256 over blob || nonce_le.
///
/// Stands in for the native PoW library during development and in tests.
pub struct Sha3Engine;

impl HashEngine for Sha3Engine {
    fn hash(&self, blob: &[u8], nonce: u32) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        hasher.update(blob);
        hasher.update(nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

/// Big-endian comparison: a hash meets the target when `hash <= target`.
///
/// Targets shorter than 32 bytes are treated as left-padded with zeros,
/// matching the big-endian hex strings the upstream protocol carries.
pub fn meets_target(hash: &[u8; 32], target: &[u8]) -> bool {
    let mut padded = [0u8; 32];
    if target.len() >= 32 {
        padded.copy_from_slice(&target[target.len() - 32..]);
    } else {
        padded[32 - target.len()..].copy_from_slice(target);
    }
    hash.as_slice() <= padded.as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha3_engine_is_deterministic() {
        let engine = Sha3Engine;
        let a = engine.hash(b"blob", 7);
        let b = engine.hash(b"blob", 7);
        let c = engine.hash(b"blob", 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn target_comparison_is_big_endian() {
        let low = [0u8; 32];
        let mut high = [0u8; 32];
        high[0] = 0xff;

        let mut target = [0u8; 32];
        target[0] = 0x0f;
        assert!(meets_target(&low, &target));
        assert!(!meets_target(&high, &target));
    }

    #[test]
    fn short_targets_are_zero_padded() {
        // 4-byte target 0xffffffff => only hashes with 28 leading zero bytes pass.
        let target = [0xff, 0xff, 0xff, 0xff];
        let mut hash = [0u8; 32];
        hash[28] = 0x01;
        assert!(meets_target(&hash, &target));
        hash[0] = 0x01;
        assert!(!meets_target(&hash, &target));
    }

    #[test]
    fn equal_hash_meets_target() {
        let mut t = [0u8; 32];
        t[31] = 0x42;
        let mut h = [0u8; 32];
        h[31] = 0x42;
        assert!(meets_target(&h, &t));
    }
}
