//! Hashing helpers
//!
//! Domain-separated SHA-256 used for:
//! - Shuffle commitments
//! - Shuffle seed derivation
//! - Stable player ids from auth subjects
//! - Room state digests sent with every broadcast

use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type Hash32 = [u8; 32];

/// Incremental hasher with a domain separator.
///
/// Order of updates is significant. Variable-length fields go through
/// [`StateHasher::update_prefixed`] so adjacent fields cannot be shifted
/// into one another.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for room state digests.
    pub fn for_room_state() -> Self {
        Self::new(b"OKEY_ROOM_STATE_V1")
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a length prefix (u64 LE) followed by the bytes.
    #[inline]
    pub fn update_prefixed(&mut self, bytes: &[u8]) {
        self.update_u64(bytes.len() as u64);
        self.hasher.update(bytes);
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a boolean.
    #[inline]
    pub fn update_bool(&mut self, value: bool) {
        self.update_u8(value as u8);
    }

    /// Update with a UUID (16 bytes).
    #[inline]
    pub fn update_uuid(&mut self, uuid: &uuid::Uuid) {
        self.hasher.update(uuid.as_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> Hash32 {
        self.hasher.finalize().into()
    }
}

/// One-shot digest of `data` under `domain`.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> Hash32 {
    let mut hasher = StateHasher::new(domain);
    hasher.update_bytes(data);
    hasher.finalize()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_hasher_determinism() {
        let make_hash = || {
            let mut hasher = StateHasher::for_room_state();
            hasher.update_u32(100);
            hasher.update_u64(12345);
            hasher.update_prefixed(b"east");
            hasher.update_bool(true);
            hasher.finalize()
        };

        assert_eq!(make_hash(), make_hash());
    }

    #[test]
    fn test_hash_order_matters() {
        let hash1 = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(1);
            h.update_u32(2);
            h.finalize()
        };

        let hash2 = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(2);
            h.update_u32(1);
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_length_prefix_prevents_shifting() {
        let hash1 = {
            let mut h = StateHasher::new(b"test");
            h.update_prefixed(b"ab");
            h.update_prefixed(b"c");
            h.finalize()
        };

        let hash2 = {
            let mut h = StateHasher::new(b"test");
            h.update_prefixed(b"a");
            h.update_prefixed(b"bc");
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_domain_separation() {
        let data = [1u8, 2, 3, 4];

        let hash1 = hash_with_domain(b"DOMAIN_A", &data);
        let hash2 = hash_with_domain(b"DOMAIN_B", &data);

        assert_ne!(hash1, hash2);
        assert_eq!(hash1, hash_with_domain(b"DOMAIN_A", &data));
    }
}
