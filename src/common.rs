use std::ops::Deref;

use crate::BitswarmError;

/// Number of checkboxes in a default deployment.
pub const DEFAULT_TOTAL_BITS: u64 = 1_000_000;

/// Size of the shared bitset, in bits.
///
/// Must be greater than 0. The persisted blob is `ceil(bits / 8)` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TotalBits(u64);

impl TotalBits {
    /// Number of bytes needed to hold every bit.
    pub fn byte_len(&self) -> usize {
        self.0.div_ceil(8) as usize
    }
}

impl Default for TotalBits {
    /// Returns one million bits.
    fn default() -> Self {
        Self(DEFAULT_TOTAL_BITS)
    }
}

impl Deref for TotalBits {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for TotalBits {
    type Error = BitswarmError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(BitswarmError::InvalidTotalBits(
                "Total bits must be greater than 0".to_string(),
            ))
        } else if value > 1u64 << 32 {
            // SETBIT offsets stop at 2^32 - 1.
            Err(BitswarmError::InvalidTotalBits(
                "Total bits must fit in a single Redis string".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Maximum number of bits allowed to be set at the same time.
///
/// A toggle that would push the aggregate count above the cap is refused
/// without touching the bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapacityCap(u64);

impl Default for CapacityCap {
    /// Returns a cap equal to the default bitset size.
    fn default() -> Self {
        Self(DEFAULT_TOTAL_BITS)
    }
}

impl Deref for CapacityCap {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<u64> for CapacityCap {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TotalBits> for CapacityCap {
    fn from(value: TotalBits) -> Self {
        Self(*value)
    }
}

/// A bit position already checked against the bitset size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitIndex(u64);

impl BitIndex {
    /// Validate a caller-supplied index against `total_bits`.
    pub fn new(index: i64, total_bits: TotalBits) -> Result<Self, BitswarmError> {
        if index < 0 || index as u64 >= *total_bits {
            return Err(BitswarmError::IndexOutOfRange {
                index,
                total_bits: *total_bits,
            });
        }

        Ok(Self(index as u64))
    }
}

impl Deref for BitIndex {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Result of one run of the atomic toggle protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleOutcome {
    /// Whether the bit was flipped.
    pub changed: bool,
    /// Bit value after the call: the new value when `changed`, otherwise the
    /// untouched current value.
    pub value: bool,
}

/// Sliding window duration in seconds.
///
/// Must be at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowSizeSeconds(pub(crate) u64);

impl WindowSizeSeconds {
    /// Window length in milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0.saturating_mul(1000)
    }
}

impl Deref for WindowSizeSeconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for WindowSizeSeconds {
    type Error = BitswarmError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < 1 {
            Err(BitswarmError::InvalidWindowSize(
                "Window size must be at least 1".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Maximum admissions per window.
///
/// Must be greater than 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowLimit(pub(crate) u64);

impl Deref for WindowLimit {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for WindowLimit {
    type Error = BitswarmError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(BitswarmError::InvalidWindowLimit(
                "Window limit must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Wall-clock milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
