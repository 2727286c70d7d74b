//! Checksum utilities for packstore
//!
//! Record payloads are protected by CRC-32 with the reversed polynomial
//! `0xEDB88320` (the IEEE variant). The checksum covers the payload only,
//! never the record header.

use crc32fast::Hasher;

/// Compute the payload checksum in one shot
#[inline]
#[must_use]
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Streaming checksum calculator, fed chunk by chunk as a body arrives
#[derive(Clone, Default)]
pub struct Checksum {
    hasher: Hasher,
}

impl Checksum {
    /// Create a new calculator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finalize and return the computed checksum
    #[must_use]
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}
