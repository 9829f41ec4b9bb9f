//! Rolling weak checksum used for block matching.
//!
//! Adler-32 variant with modulus 65521. The window can slide by one byte in
//! O(1), which is what makes scanning a source file against a signature
//! affordable. The digest is part of the signature wire format and must not
//! change.

/// Modulus for both checksum halves.
/// Largest prime less than 2^16 for good distribution.
const MOD: u64 = 65521;

/// Normalize every N rolls to keep the lazy sums far from overflow.
const NORMALIZE_INTERVAL: u32 = 4096;

/// Compute the weak checksum of a whole block in one go.
///
/// Equivalent to `RollingChecksum::new(data).digest()`.
///
/// # Example
///
/// ```rust
/// use sutura::{weak_hash, RollingChecksum};
///
/// let data = b"block contents";
/// assert_eq!(weak_hash(data), RollingChecksum::new(data).digest());
/// ```
#[must_use]
pub fn weak_hash(data: &[u8]) -> u32 {
    RollingChecksum::new(data).digest()
}

/// Rolling checksum over a fixed-size window.
///
/// The checksum consists of two components:
/// - `a`: sum of all bytes in the window
/// - `b`: weighted sum where each byte is multiplied by its distance from the end
///
/// Both are kept lazily reduced and folded modulo 65521 on [`digest`](Self::digest),
/// which combines them as `(b << 16) | a`.
///
/// # Example
///
/// ```rust
/// use sutura::RollingChecksum;
///
/// let mut rolling = RollingChecksum::new(b"hello");
/// rolling.roll(b'h', b'!');
/// assert_eq!(rolling.digest(), RollingChecksum::new(b"ello!").digest());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingChecksum {
    a: u64,
    b: u64,
    count: usize,
    rolls: u32,
}

impl RollingChecksum {
    /// Create a checksum over an initial window.
    #[must_use]
    pub fn new(data: &[u8]) -> Self {
        let len = data.len() as u64;
        let (a, b) = data
            .iter()
            .enumerate()
            .fold((0u64, 0u64), |(a, b), (i, &byte)| {
                let byte = u64::from(byte);
                ((a + byte) % MOD, (b + (len - i as u64) * byte) % MOD)
            });

        Self {
            a,
            b,
            count: data.len(),
            rolls: 0,
        }
    }

    /// Slide the window by one byte: drop `old_byte` at the front, append
    /// `new_byte` at the back. The window size is unchanged.
    #[inline]
    pub fn roll(&mut self, old_byte: u8, new_byte: u8) {
        let old = u64::from(old_byte);
        let new = u64::from(new_byte);
        let count = self.count as u64;

        self.a = self.a + MOD + new - old;
        self.b = self.b + MOD * count + self.a - count * old;

        self.rolls += 1;
        if self.rolls >= NORMALIZE_INTERVAL {
            self.a %= MOD;
            self.b %= MOD;
            self.rolls = 0;
        }
    }

    /// 32-bit digest of the current window.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn digest(&self) -> u32 {
        let a = (self.a % MOD) as u32;
        let b = (self.b % MOD) as u32;
        (b << 16) | a
    }

    /// Window size in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Whether the window is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // UNIT TESTS - Basic functionality
    // ==========================================================================

    #[test]
    fn empty_window() {
        let checksum = RollingChecksum::new(b"");
        assert_eq!(checksum.digest(), 0);
        assert!(checksum.is_empty());
    }

    #[test]
    fn single_byte() {
        let checksum = RollingChecksum::new(&[1]);
        // a = 1, b = 1 * 1
        assert_eq!(checksum.digest(), (1 << 16) | 1);
        assert_eq!(checksum.len(), 1);
    }

    #[test]
    fn known_value() {
        // a = 1 + 2 + 3 = 6, b = 3*1 + 2*2 + 1*3 = 10
        let checksum = RollingChecksum::new(&[1, 2, 3]);
        assert_eq!(checksum.digest(), (10 << 16) | 6);
    }

    #[test]
    fn deterministic() {
        let data = b"the quick brown fox";
        assert_eq!(weak_hash(data), weak_hash(data));
    }

    #[test]
    fn order_sensitive() {
        assert_ne!(weak_hash(b"ab"), weak_hash(b"ba"));
    }

    // ==========================================================================
    // ROLLING TESTS
    // ==========================================================================

    #[test]
    fn roll_matches_fresh_computation() {
        let data: Vec<u8> = (0..=255).cycle().take(4096).collect();
        let window = 512;
        let mut rolling = RollingChecksum::new(&data[..window]);

        for start in 1..=(data.len() - window) {
            rolling.roll(data[start - 1], data[start + window - 1]);
            assert_eq!(
                rolling.digest(),
                weak_hash(&data[start..start + window]),
                "mismatch at offset {start}"
            );
        }
    }

    #[test]
    fn roll_survives_normalization() {
        let data = vec![0xFFu8; 20_000];
        let window = 64;
        let mut rolling = RollingChecksum::new(&data[..window]);
        for start in 1..=(data.len() - window) {
            rolling.roll(data[start - 1], data[start + window - 1]);
        }
        assert_eq!(rolling.digest(), weak_hash(&data[..window]));
    }

    #[test]
    fn full_size_block_of_max_bytes() {
        let data = vec![0xFFu8; 64 * 1024];
        let digest = weak_hash(&data);
        assert_eq!(digest & 0xFFFF, ((0xFFu64 * 65536) % MOD) as u32);
    }
}
