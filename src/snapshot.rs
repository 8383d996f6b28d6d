use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use serde::{Deserialize, Serialize};

use crate::{Bitset, BitswarmError, TotalBits, common::now_ms};

/// Full point-in-time view of the bitset.
///
/// `full_state` is the whole bitset (never a delta), base64 encoded with the
/// standard alphabet and no padding. Run-length encodings are not produced:
/// they get larger than the raw vector once many bits are set.
///
/// `bits` and `count` are read together from the same source, but that source
/// may be a replica that trails the primary. Clients treat a snapshot as a
/// resync point, not as the latest truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Encoded bitset.
    pub full_state: String,
    /// Aggregate set-bit count as stored next to the bitset.
    pub count: u64,
    /// Wall-clock milliseconds when the snapshot was assembled.
    pub timestamp: u64,
}

impl Snapshot {
    /// Assemble a snapshot from raw bitset bytes and a count, stamped now.
    pub fn encode(bits: &[u8], count: u64) -> Self {
        Self {
            full_state: STANDARD_NO_PAD.encode(bits),
            count,
            timestamp: now_ms(),
        }
    }

    /// Decode `full_state` back into a bitset of `total_bits`.
    pub fn decode(&self, total_bits: TotalBits) -> Result<Bitset, BitswarmError> {
        let bytes = STANDARD_NO_PAD
            .decode(self.full_state.as_bytes())
            .map_err(|err| BitswarmError::MalformedSnapshot(err.to_string()))?;

        if bytes.len() > total_bits.byte_len() {
            return Err(BitswarmError::MalformedSnapshot(format!(
                "{} bytes do not fit in {} bits",
                bytes.len(),
                *total_bits
            )));
        }

        Ok(Bitset::from_bytes(bytes, total_bits))
    }
}
