//! 32-byte SHA-256 digest type with zero-allocation hashing.

use crate::types::value::{EncodeSink, PlainValue, Value, ValueError};
use sha2::{Digest, Sha256};
use std::fmt;

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 32;

/// Fixed-size 32-byte SHA-256 digest used for block hashes and tx ids.
///
/// `Copy` on purpose: digests are passed around constantly during chain
/// validation and index walks, and a 32-byte stack copy beats the
/// indirection of sharing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HashDigest(pub [u8; DIGEST_LEN]);

/// Identifier of a transaction: the digest of its signed canonical encoding.
pub type TxId = HashDigest;

impl HashDigest {
    /// The all-zero digest, used as a sentinel in tests and defaults.
    pub const fn zero() -> HashDigest {
        HashDigest([0u8; DIGEST_LEN])
    }

    /// Returns the digest as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates a digest from a byte slice of exactly [`DIGEST_LEN`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<HashDigest> {
        let bytes: [u8; DIGEST_LEN] = slice.try_into().ok()?;
        Some(HashDigest(bytes))
    }

    /// Starts an incremental SHA-256 computation.
    pub fn sha256() -> DigestBuilder {
        DigestBuilder::new()
    }

    /// Convenience digest of a single byte slice.
    pub fn of(data: &[u8]) -> HashDigest {
        DigestBuilder::new().chain(data).finalize()
    }

    /// Counts leading zero bits, interpreting the digest MSB-first.
    ///
    /// The proof-of-work rule is `leading_zero_bits() >= difficulty`.
    pub fn leading_zero_bits(&self) -> i64 {
        let mut bits = 0i64;
        for byte in &self.0 {
            if *byte == 0 {
                bits += 8;
            } else {
                bits += byte.leading_zeros() as i64;
                break;
            }
        }
        bits
    }

    /// Returns whether this digest satisfies the given difficulty.
    pub fn satisfies(&self, difficulty: i64) -> bool {
        difficulty <= 0 || self.leading_zero_bits() >= difficulty
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl PlainValue for HashDigest {
    fn to_value(&self) -> Value {
        Value::bytes(self.0.to_vec())
    }

    fn from_value(value: &Value) -> Result<Self, ValueError> {
        value
            .as_bytes()
            .and_then(HashDigest::from_slice)
            .ok_or(ValueError::Mismatch { expected: "32-byte digest" })
    }
}

/// Incremental SHA-256 builder.
///
/// Implements [`EncodeSink`] so canonical values hash directly without an
/// intermediate buffer.
pub struct DigestBuilder {
    hasher: Sha256,
}

impl DigestBuilder {
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }

    /// Feeds data into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn chain(mut self, data: &[u8]) -> Self {
        self.hasher.update(data);
        self
    }

    /// Consumes the builder and returns the digest.
    pub fn finalize(self) -> HashDigest {
        HashDigest(self.hasher.finalize().into())
    }
}

impl Default for DigestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeSink for DigestBuilder {
    fn write(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }
}

/// Folds the first eight bytes little-endian into a signed 64-bit integer.
///
/// Shorter inputs are zero-extended. Used by the evaluation-order shuffle.
pub(crate) fn int64_of(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    i64::from_le_bytes(buf)
}

/// Folds the first four bytes little-endian into a signed 32-bit integer.
///
/// Shorter inputs are zero-extended. Used to derive per-action random seeds.
pub(crate) fn int32_of(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    let n = bytes.len().min(4);
    buf[..n].copy_from_slice(&bytes[..n]);
    i32::from_le_bytes(buf)
}
