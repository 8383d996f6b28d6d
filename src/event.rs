use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize, Serializer};

use crate::{BitswarmError, Snapshot, TotalBits};

/// One accepted toggle, as published on the store's toggle channel.
///
/// On the wire this is the JSON array `[index, 0|1, timestamp_ms]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleEvent {
    /// Toggled bit.
    pub index: u64,
    /// Value after the toggle.
    pub new_value: bool,
    /// Wall-clock milliseconds when the toggle was committed.
    pub timestamp_ms: u64,
}

impl ToggleEvent {
    /// Encode for publishing.
    pub fn encode(&self) -> String {
        format!(
            "[{},{},{}]",
            self.index,
            u8::from(self.new_value),
            self.timestamp_ms
        )
    }

    /// Decode a payload received from the toggle channel.
    ///
    /// Indices outside of `total_bits` are rejected so a bad publisher cannot
    /// make clients index past their bitset.
    pub fn decode(payload: &str, total_bits: TotalBits) -> Result<Self, BitswarmError> {
        let (index, value, timestamp_ms): (u64, u8, u64) = serde_json::from_str(payload)
            .map_err(|err| BitswarmError::MalformedEvent(format!("{payload}: {err}")))?;

        if index >= *total_bits {
            return Err(BitswarmError::MalformedEvent(format!(
                "{payload}: index out of range"
            )));
        }

        let new_value = match value {
            0 => false,
            1 => true,
            _ => {
                return Err(BitswarmError::MalformedEvent(format!(
                    "{payload}: value must be 0 or 1"
                )));
            }
        };

        Ok(Self {
            index,
            new_value,
            timestamp_ms,
        })
    }
}

/// Toggles drained in one fanout tick, reduced to each index's final state.
///
/// Serialized as `[[true indices...], [false indices...], timestamp]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleBatch {
    /// Indices whose final state in the batch is set.
    pub true_indices: Vec<u64>,
    /// Indices whose final state in the batch is unset.
    pub false_indices: Vec<u64>,
    /// Largest event timestamp in the batch.
    pub timestamp: u64,
}

impl Serialize for ToggleBatch {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (&self.true_indices, &self.false_indices, self.timestamp).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ToggleBatch {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (true_indices, false_indices, timestamp) =
            <(Vec<u64>, Vec<u64>, u64)>::deserialize(deserializer)?;

        Ok(Self {
            true_indices,
            false_indices,
            timestamp,
        })
    }
}

/// Accumulates drained events into a [`ToggleBatch`].
///
/// Repeated toggles of one index within a batch collapse to the last one
/// pushed. Clients only need the final state, and relaying every transition
/// would let a single flapping bit fill the batch.
#[derive(Debug, Default)]
pub struct ToggleBatchBuilder {
    switches: BTreeMap<u64, bool>,
    max_timestamp: u64,
    events: usize,
}

impl ToggleBatchBuilder {
    /// Record one event.
    pub fn push(&mut self, event: ToggleEvent) {
        self.switches.insert(event.index, event.new_value);
        self.max_timestamp = self.max_timestamp.max(event.timestamp_ms);
        self.events += 1;
    }

    /// Number of events pushed, duplicates included.
    pub fn events(&self) -> usize {
        self.events
    }

    /// Build the batch, or `None` when nothing was pushed.
    pub fn finish(self) -> Option<ToggleBatch> {
        if self.switches.is_empty() {
            return None;
        }

        let (on, off): (Vec<_>, Vec<_>) = self.switches.into_iter().partition(|(_, v)| *v);

        Some(ToggleBatch {
            true_indices: on.into_iter().map(|(k, _)| k).collect(),
            false_indices: off.into_iter().map(|(k, _)| k).collect(),
            timestamp: self.max_timestamp,
        })
    }
}

/// Message sent from the server to every connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Broadcast {
    /// Periodic or on-connect full snapshot.
    FullState(Arc<Snapshot>),
    /// Per-tick batch of toggles.
    BatchedBitToggles(Arc<ToggleBatch>),
}

impl Broadcast {
    /// Event name used on the real-time channel.
    pub fn event_name(&self) -> &'static str {
        match self {
            Broadcast::FullState(_) => "full_state",
            Broadcast::BatchedBitToggles(_) => "batched_bit_toggles",
        }
    }

    /// JSON text frame for the real-time channel.
    pub fn to_message(&self) -> Result<String, BitswarmError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Message sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Request to flip one bit.
    ToggleBit {
        /// Requested index; validated by the toggle service.
        index: i64,
    },
}

impl ClientMessage {
    /// Parse a JSON text frame.
    pub fn parse(text: &str) -> Result<Self, BitswarmError> {
        Ok(serde_json::from_str(text)?)
    }
}
