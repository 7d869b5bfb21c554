//! Deterministic bucketing primitives: the SHA-256 hasher that assigns
//! subjects to rollout buckets, and the fixed-size bitmap used by
//! `bucket_set` traffic rules.
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Number of buckets a `bucket_set` bitmap covers.
pub const BUCKET_BITS: usize = 1000;

/// Hash `{id}.{salt}` with SHA-256 and interpret the first 8 bytes as a
/// big-endian unsigned 64-bit integer.
///
/// Rollout gates compare `hash_u64(..) % 10000` against `rollout * 100`, so
/// a 50.0% rollout admits exactly the buckets below 5000.
pub fn hash_u64(id: &str, salt: &str) -> u64 {
    let digest = Sha256::digest(format!("{id}.{salt}").as_bytes());
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

/// A fixed-size bitmap with big-endian bit order within each byte: bit 0 is
/// the most-significant bit of byte 0. Encoded on the wire as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketBitmap {
    data: Vec<u8>,
}

impl BucketBitmap {
    /// Create a zeroed bitmap covering `bits` positions.
    pub fn new(bits: usize) -> BucketBitmap {
        // 1000 bits = 125 bytes, 1001 bits = 126 bytes
        BucketBitmap {
            data: vec![0; (bits + 7) / 8],
        }
    }

    /// Encode the bitmap as a lowercase hex string in network byte order.
    pub fn to_hex_string(&self) -> String {
        hex::encode(&self.data)
    }

    /// Load the bitmap from a hex string in network byte order.
    ///
    /// A string shorter than the bitmap leaves the trailing bits untouched; a
    /// longer string is truncated to the bitmap length.
    pub fn load_hex_string(&mut self, encoded: &str) -> Result<()> {
        let bytes = hex::decode(encoded)
            .map_err(|err| Error::BucketSetValue(format!("load bucket_set failed: {err}")))?;
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        Ok(())
    }

    /// Set the bit at `pos` to 1. Out-of-range positions are ignored.
    pub fn set_bit(&mut self, pos: usize) {
        if pos >= self.data.len() * 8 {
            return;
        }
        self.data[pos / 8] |= 1 << (7 - pos % 8);
    }

    /// Clear the bit at `pos`. Out-of-range positions are ignored.
    pub fn clear_bit(&mut self, pos: usize) {
        if pos >= self.data.len() * 8 {
            return;
        }
        self.data[pos / 8] &= !(1 << (7 - pos % 8));
    }

    /// Return the bit value at `pos`, or 0 when `pos` is out of range.
    pub fn get_bit(&self, pos: usize) -> u8 {
        if pos >= self.data.len() * 8 {
            return 0;
        }
        (self.data[pos / 8] >> (7 - pos % 8)) & 1
    }

    /// Count the number of bits set to 1.
    pub fn count(&self) -> usize {
        self.data.iter().map(|b| b.count_ones() as usize).sum()
    }
}
