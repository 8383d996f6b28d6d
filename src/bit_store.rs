//! Narrow interface to the shared state store.
//!
//! Everything that touches the bitset goes through [`BitStore`]. The backend is
//! picked once at startup (see [`BackendOptions`](crate::BackendOptions)) and
//! held as `Arc<dyn BitStore>` from then on.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{BitIndex, BitswarmError, Snapshot, ToggleEvent, ToggleOutcome};

/// Raw payloads received from the store's toggle channel.
///
/// Payloads are handed over undecoded so the consumer decides what to do with
/// malformed ones. The channel closes when the underlying subscription is
/// lost.
pub type Subscription = mpsc::Receiver<String>;

/// Storage backend for the bitset, its aggregate count, the toggle channel and
/// the toggle log.
#[async_trait]
pub trait BitStore: Send + Sync {
    /// Read one bit from the read path.
    async fn get_bit(&self, index: BitIndex) -> Result<bool, BitswarmError>;

    /// Flip one bit under the capacity cap, atomically with the count.
    ///
    /// Reports whether a change happened. Publishing the resulting event is
    /// the caller's job.
    async fn toggle(&self, index: BitIndex) -> Result<ToggleOutcome, BitswarmError>;

    /// Aggregate set-bit count from the read path.
    async fn count(&self) -> Result<u64, BitswarmError>;

    /// Full snapshot from the read path.
    async fn snapshot(&self) -> Result<Snapshot, BitswarmError>;

    /// Publish an accepted toggle to every subscriber, this process included.
    async fn publish(&self, event: &ToggleEvent) -> Result<(), BitswarmError>;

    /// Open a new subscription to the toggle channel.
    async fn subscribe(&self) -> Result<Subscription, BitswarmError>;

    /// Append records to a daily log bucket, keeping at most `max_entries`.
    async fn append_toggle_log(
        &self,
        bucket: &str,
        records: &[String],
        max_entries: u64,
    ) -> Result<(), BitswarmError>;
}
