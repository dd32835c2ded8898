// Hashing utilities

use sha2::{Sha256, Digest};
use crate::core::Hash256;

/// SHA256 double hash
/// hash256 = SHA256(SHA256(data))
pub fn hash256(data: &[u8]) -> Hash256 {
    let first_hash = Sha256::digest(data);
    let second_hash = Sha256::digest(first_hash);
    Hash256::new(second_hash.into())
}

/// RIPEMD160(SHA256(data)) - used for address generation
pub fn hash160(data: &[u8]) -> [u8; 20] {
    use ripemd::{Ripemd160, Digest as RipemdDigest};
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// Double SHA256 over a fixed prefix followed by a varying suffix.
///
/// The prefix state is absorbed once; `finish` clones it for every suffix, so
/// a nonce search does not re-hash the block body on each attempt.
#[derive(Clone)]
pub struct PrefixHasher {
    state: Sha256,
}

impl PrefixHasher {
    pub fn new(prefix: &[u8]) -> Self {
        let mut state = Sha256::new();
        state.update(prefix);
        Self { state }
    }

    pub fn finish(&self, suffix: &[u8]) -> Hash256 {
        let first = self.state.clone().chain_update(suffix).finalize();
        Hash256::new(Sha256::digest(first).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash256() {
        let data = b"hello world";
        let hash = hash256(data);
        assert_eq!(hash.as_bytes().len(), 32);

        // Same data should produce same hash
        let hash2 = hash256(data);
        assert_eq!(hash, hash2);
        assert_ne!(hash, hash256(b"hello worle"));
    }

    #[test]
    fn test_hash160() {
        let data = b"test data";
        let hash = hash160(data);
        assert_eq!(hash.len(), 20);
    }

    #[test]
    fn test_prefix_hasher_matches_hash256() {
        let hasher = PrefixHasher::new(b"block body ");
        let expected = hash256(b"block body nonce=7");
        assert_eq!(hasher.finish(b"nonce=7"), expected);
        assert_ne!(hasher.finish(b"nonce=8"), expected);
    }
}
