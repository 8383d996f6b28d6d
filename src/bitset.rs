//! Byte layout of the shared bitset.
//!
//! Bit `i` lives in byte `i / 8` under mask `0x80 >> (i % 8)`, the order Redis
//! uses for `GETBIT`/`SETBIT`. Keeping that order in the in-memory backend
//! means both backends produce byte-identical snapshots.

use crate::TotalBits;

/// Owned bitset bytes plus their logical length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitset {
    bytes: Vec<u8>,
    total_bits: TotalBits,
}

impl Bitset {
    /// An all-zero bitset.
    pub fn new(total_bits: TotalBits) -> Self {
        Self {
            bytes: vec![0; total_bits.byte_len()],
            total_bits,
        }
    }

    /// Wrap raw bytes, padding or truncating to the expected length.
    ///
    /// Redis grows its string lazily on `SETBIT`, so a short blob is a normal
    /// state right after bootstrap.
    pub fn from_bytes(mut bytes: Vec<u8>, total_bits: TotalBits) -> Self {
        bytes.resize(total_bits.byte_len(), 0);
        Self { bytes, total_bits }
    }

    /// Value of bit `index`. Out of range reads as unset.
    pub fn get(&self, index: u64) -> bool {
        if index >= *self.total_bits {
            return false;
        }

        let (byte, mask) = position(index);
        self.bytes[byte] & mask != 0
    }

    /// Write bit `index`. Returns the previous value.
    pub(crate) fn set(&mut self, index: u64, value: bool) -> bool {
        let (byte, mask) = position(index);
        let previous = self.bytes[byte] & mask != 0;

        if value {
            self.bytes[byte] |= mask;
        } else {
            self.bytes[byte] &= !mask;
        }

        previous
    }

    /// Population count over the logical bits.
    pub fn count_ones(&self) -> u64 {
        self.bytes.iter().map(|b| b.count_ones() as u64).sum()
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size in bits.
    pub fn total_bits(&self) -> TotalBits {
        self.total_bits
    }
}

#[inline]
fn position(index: u64) -> (usize, u8) {
    ((index / 8) as usize, 0x80u8 >> (index % 8))
}
