//! Hashing utilities.
//!
//! Chunks carry two hashes: a SHA1 digest of the uncompressed payload
//! used for verification, and a 64-bit cyclic-polynomial rolling hash
//! that identifies matching windows when generating builds.

#[cfg(test)]
mod tests;

use lazy_static::lazy_static;
use sha1::{Digest, Sha1};

/// Polynomial used to generate the rolling hash table (CRC-64/ECMA, reflected).
const ROLLING_HASH_POLY: u64 = 0xC96C_5795_D787_0F42;

lazy_static! {
    static ref ROLLING_HASH_TABLE: [u64; 256] = {
        let mut table = [0u64; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut value = i as u64;
            for _ in 0..8 {
                value = if value & 1 == 1 {
                    (value >> 1) ^ ROLLING_HASH_POLY
                } else {
                    value >> 1
                };
            }
            *entry = value;
        }
        table
    };
}

/// A hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkHash {
    /// An SHA-1 hash.
    Sha1([u8; 20]),
}

impl ChunkHash {
    /// Convenience function to generate a SHA-1 hash from a slice.
    pub fn sha1_from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self::Sha1(hasher.finalize().into())
    }

    /// Returns the hash in hexadecimal format, with the hash type prepended.
    pub fn to_typed_base16(&self) -> String {
        format!("{}:{}", self.hash_type(), hex::encode(self.data()))
    }

    /// Returns the raw digest.
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Sha1(d) => d,
        }
    }

    fn hash_type(&self) -> &'static str {
        match self {
            Self::Sha1(_) => "sha1",
        }
    }
}

/// Computes the rolling hash of a buffer.
///
/// `hash(b[0..w]) = XOR rotl(T[b[i]], w - 1 - i)`.
pub fn rolling_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |state, byte| {
        state.rotate_left(1) ^ ROLLING_HASH_TABLE[*byte as usize]
    })
}
