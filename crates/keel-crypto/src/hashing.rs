use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;

use crate::{HashFunc, HASH_BLAKE2B_256};

type KeyedBlake2b256 = Blake2bMac<U32>;

/// Keyed BLAKE2b-256 (BLAKE2b-MAC with 32-byte output).
///
/// Keying with a per-repository secret keeps content IDs from leaking which
/// well-known plaintexts a repository holds.
pub struct KeyedBlake2b {
    key: [u8; 32],
}

impl KeyedBlake2b {
    pub fn new(key: &[u8; 32]) -> Self {
        Self { key: *key }
    }
}

impl HashFunc for KeyedBlake2b {
    fn hash(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = <KeyedBlake2b256 as Mac>::new_from_slice(&self.key)
            .expect("valid 32-byte key for BLAKE2b");
        Mac::update(&mut hasher, data);
        hasher.finalize().into_bytes().to_vec()
    }

    fn output_len(&self) -> usize {
        32
    }

    fn name(&self) -> &'static str {
        HASH_BLAKE2B_256
    }
}
