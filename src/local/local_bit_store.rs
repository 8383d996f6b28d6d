use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    BitIndex, BitStore, Bitset, BitswarmError, CapacityCap, Snapshot, Subscription, ToggleEvent,
    ToggleOutcome, TotalBits,
};

/// Most toggle log records a [`LocalBitStore`] holds, whatever the per-day
/// limit passed to it.
pub const LOCAL_MAX_LOG_ENTRIES: u64 = 100_000;

/// Configuration for [`LocalBitStore`].
#[derive(Clone, Debug)]
pub struct LocalBitStoreOptions {
    /// Size of the bitset.
    pub total_bits: TotalBits,
    /// Maximum number of set bits.
    pub capacity: CapacityCap,
    /// Per-subscriber queue length. Publishes to a full queue are dropped.
    pub subscription_capacity: usize,
}

impl Default for LocalBitStoreOptions {
    fn default() -> Self {
        Self {
            total_bits: TotalBits::default(),
            capacity: CapacityCap::default(),
            subscription_capacity: 4096,
        }
    }
}

struct BitsetState {
    bits: Bitset,
    count: u64,
}

struct LocalToggleLog {
    bucket: String,
    records: Vec<String>,
}

/// In-process store for single-process deployments and tests.
///
/// The bitset and its count sit behind one mutex, so every toggle sees and
/// leaves them consistent. Pub/sub is an in-process fanout to every
/// subscription, the caller's own included. State does not survive a restart.
///
/// Only the newest toggle log bucket is kept, capped at
/// [`LOCAL_MAX_LOG_ENTRIES`]. Starting a new day drops the previous one.
pub struct LocalBitStore {
    state: Mutex<BitsetState>,
    capacity: CapacityCap,
    subscription_capacity: usize,
    subscribers: DashMap<u64, mpsc::Sender<String>>,
    next_subscriber: AtomicU64,
    log: Mutex<Option<LocalToggleLog>>,
}

impl LocalBitStore {
    /// Create an empty store.
    pub fn new(options: LocalBitStoreOptions) -> Self {
        Self {
            state: Mutex::new(BitsetState {
                bits: Bitset::new(options.total_bits),
                count: 0,
            }),
            capacity: options.capacity,
            subscription_capacity: options.subscription_capacity.max(1),
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(0),
            log: Mutex::new(None),
        }
    } // end constructor

    /// Records currently held in a log bucket. Empty unless `bucket` is the
    /// newest one written.
    pub fn toggle_log(&self, bucket: &str) -> Vec<String> {
        self.log
            .lock()
            .as_ref()
            .filter(|log| log.bucket == bucket)
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
} // end impl LocalBitStore

#[async_trait]
impl BitStore for LocalBitStore {
    async fn get_bit(&self, index: BitIndex) -> Result<bool, BitswarmError> {
        Ok(self.state.lock().bits.get(*index))
    }

    async fn toggle(&self, index: BitIndex) -> Result<ToggleOutcome, BitswarmError> {
        let mut state = self.state.lock();

        let current = state.bits.get(*index);
        let new_value = !current;

        if new_value && state.count.saturating_add(1) > *self.capacity {
            return Ok(ToggleOutcome {
                changed: false,
                value: current,
            });
        }

        state.bits.set(*index, new_value);
        if new_value {
            state.count += 1;
        } else {
            state.count -= 1;
        }

        Ok(ToggleOutcome {
            changed: true,
            value: new_value,
        })
    } // end method toggle

    async fn count(&self) -> Result<u64, BitswarmError> {
        Ok(self.state.lock().count)
    }

    async fn snapshot(&self) -> Result<Snapshot, BitswarmError> {
        let (bytes, count) = {
            let state = self.state.lock();
            (state.bits.as_bytes().to_vec(), state.count)
        };

        Ok(Snapshot::encode(&bytes, count))
    }

    async fn publish(&self, event: &ToggleEvent) -> Result<(), BitswarmError> {
        let payload = event.encode();
        let mut closed = Vec::new();

        for subscriber in self.subscribers.iter() {
            match subscriber.value().try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscriber = *subscriber.key(),
                        "Toggle subscription is full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*subscriber.key()),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }

        Ok(())
    } // end method publish

    async fn subscribe(&self) -> Result<Subscription, BitswarmError> {
        let (tx, rx) = mpsc::channel(self.subscription_capacity);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);

        Ok(rx)
    }

    async fn append_toggle_log(
        &self,
        bucket: &str,
        records: &[String],
        max_entries: u64,
    ) -> Result<(), BitswarmError> {
        let max_entries = max_entries.min(LOCAL_MAX_LOG_ENTRIES) as usize;
        let mut log = self.log.lock();

        if log.as_ref().is_some_and(|current| current.bucket.as_str() > bucket) {
            tracing::debug!(bucket, "Dropping toggle log records for a past day");
            return Ok(());
        }

        if log.as_ref().is_none_or(|current| current.bucket != bucket) {
            *log = Some(LocalToggleLog {
                bucket: bucket.to_string(),
                records: Vec::new(),
            });
        }

        let Some(current) = log.as_mut() else {
            return Ok(());
        };

        let room = max_entries.saturating_sub(current.records.len());
        current.records.extend(records.iter().take(room).cloned());

        Ok(())
    } // end method append_toggle_log
}
