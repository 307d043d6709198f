//! FNV-1a 64-bit hashing for content etags.

use std::hash::Hasher;

const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const PRIME: u64 = 0x0000_0100_0000_01b3;

/// Streaming FNV-1a 64-bit hasher.
///
/// Etags are derived from it, so its output is part of the stored format
/// and must never change.
#[derive(Debug, Clone, Copy)]
pub struct Fnv64 {
    state: u64,
}

impl Default for Fnv64 {
    fn default() -> Self {
        Self {
            state: OFFSET_BASIS,
        }
    }
}

impl Fnv64 {
    /// Creates a hasher in its initial state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes.
    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(PRIME);
        }
    }

    /// Feeds one field followed by a terminator, so that adjacent fields
    /// cannot run into each other.
    pub fn field(&mut self, bytes: &[u8]) {
        self.update(bytes);
        self.update(&[0xff]);
    }

    /// Returns the hash of everything fed so far.
    #[must_use]
    pub fn digest(&self) -> u64 {
        self.state
    }
}

impl Hasher for Fnv64 {
    fn finish(&self) -> u64 {
        self.digest()
    }

    fn write(&mut self, bytes: &[u8]) {
        self.update(bytes);
    }
}

/// Hashes one byte slice.
#[must_use]
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hasher = Fnv64::new();
    hasher.update(bytes);
    hasher.digest()
}

/// Formats a hash as an etag: its decimal representation.
#[must_use]
pub fn etag(hash: u64) -> String {
    hash.to_string()
}
