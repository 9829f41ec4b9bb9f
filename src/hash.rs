//! Strong hash implementation using BLAKE3.
//!
//! The strong hash confirms block matches proposed by the weak rolling
//! checksum, verifies blocks during apply and validation, and content-addresses
//! big blocks in the remote block store.

use serde::{Deserialize, Serialize};

/// Strong cryptographic hash of a block.
///
/// Always the full 32-byte BLAKE3 digest. Signatures, manifests and block
/// store addresses all depend on this exact choice.
///
/// # Example
///
/// ```rust
/// use sutura::StrongHash;
///
/// let hash1 = StrongHash::compute(b"hello world");
/// let hash2 = StrongHash::compute(b"hello world");
/// assert_eq!(hash1, hash2);
/// assert_ne!(hash1, StrongHash::compute(b"different data"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrongHash([u8; 32]);

impl StrongHash {
    /// Compute the BLAKE3 hash of `data`.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Create a `StrongHash` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the hash.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, used for content-addressed store paths.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl From<blake3::Hash> for StrongHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl std::fmt::Debug for StrongHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StrongHash(")?;
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "...)")
    }
}

impl std::fmt::Display for StrongHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for StrongHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_deterministic() {
        let data = b"test data for hashing";
        assert_eq!(StrongHash::compute(data), StrongHash::compute(data));
    }

    #[test]
    fn different_lengths_differ() {
        assert_ne!(StrongHash::compute(&[0u8; 10]), StrongHash::compute(&[0u8; 11]));
    }

    #[test]
    fn from_blake3_matches_compute() {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"split ");
        hasher.update(b"input");
        assert_eq!(StrongHash::from(hasher.finalize()), StrongHash::compute(b"split input"));
    }

    #[test]
    fn hex_is_64_chars() {
        let hex = StrongHash::compute(b"test").to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_is_abbreviated() {
        let debug = format!("{:?}", StrongHash::compute(b"test"));
        assert!(debug.starts_with("StrongHash("));
        assert!(debug.ends_with("...)"));
    }

    #[test]
    fn serde_size() {
        let hash = StrongHash::compute(b"test");
        let serialized = bincode::serialize(&hash).unwrap();
        assert_eq!(serialized.len(), 32);
        let back: StrongHash = bincode::deserialize(&serialized).unwrap();
        assert_eq!(back, hash);
    }
}
