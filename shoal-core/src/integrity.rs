//! Integrity: per-block hash and byte-for-byte verification before a block is stored.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224, Sha256, Sha512};

/// Hash algorithm used for block hashes. Fixed per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    #[default]
    Sha256,
    Sha224,
    Sha512,
}

impl HashAlg {
    /// Digest length in bytes.
    pub fn hash_size(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Sha224 => 28,
            HashAlg::Sha512 => 64,
        }
    }
}

/// Hash a block payload.
pub fn hash_block(alg: HashAlg, payload: &[u8]) -> Vec<u8> {
    match alg {
        HashAlg::Sha256 => Sha256::digest(payload).to_vec(),
        HashAlg::Sha224 => Sha224::digest(payload).to_vec(),
        HashAlg::Sha512 => Sha512::digest(payload).to_vec(),
    }
}

/// Verify block payload against the expected hash.
pub fn verify_block(alg: HashAlg, payload: &[u8], expected_hash: &[u8]) -> bool {
    hash_block(alg, payload) == expected_hash
}
