//! Turns the store's toggle channel into broadcasts for locally connected
//! clients.
//!
//! Two independent tasks feed one [`tokio::sync::broadcast`] channel:
//!
//! - **drain:** every `drain_interval`, take at most `max_batch_events`
//!   payloads from the store subscription and broadcast them as one
//!   deduplicated [`ToggleBatch`]. Excess payloads wait in the subscription
//!   for the next tick.
//! - **resync:** every `snapshot_interval`, broadcast a full [`Snapshot`]
//!   from the read path. Pub/sub gives no delivery guarantee, so this bounds
//!   how long any client can drift.
//!
//! No ordering is promised across processes; clients converge on the next
//! snapshot.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc::error::TryRecvError},
    task::JoinHandle,
};

use crate::{
    BitStore, BitswarmError, Broadcast, Snapshot, Subscription, ToggleBatch, ToggleBatchBuilder,
    ToggleEvent, TotalBits,
};

/// Configuration for [`FanoutCoordinator`].
#[derive(Clone, Debug)]
pub struct FanoutOptions {
    /// Drain tick.
    pub drain_interval: Duration,
    /// Most payloads taken from the subscription per drain tick.
    pub max_batch_events: usize,
    /// Full snapshot cadence.
    pub snapshot_interval: Duration,
    /// Broadcasts buffered per client before it is considered lagging.
    pub client_buffer: usize,
}

impl Default for FanoutOptions {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_millis(100),
            max_batch_events: 400,
            snapshot_interval: Duration::from_secs(50),
            client_buffer: 256,
        }
    }
}

/// A newly attached client: the snapshot to send first, then everything
/// broadcast after it.
pub struct ClientFeed {
    /// State at attach time.
    pub snapshot: Snapshot,
    /// Broadcasts from attach time on.
    pub receiver: broadcast::Receiver<Broadcast>,
}

/// Result of one drain tick.
#[derive(Debug, Default)]
pub(crate) struct Drained {
    pub batch: Option<ToggleBatch>,
    pub malformed: usize,
    pub disconnected: bool,
}

/// Fans store toggle events out to the clients of this process.
#[derive(Clone)]
pub struct FanoutCoordinator {
    store: Arc<dyn BitStore>,
    total_bits: TotalBits,
    options: FanoutOptions,
    broadcaster: broadcast::Sender<Broadcast>,
}

impl FanoutCoordinator {
    /// Create a coordinator. Nothing runs until [`start`](Self::start).
    pub fn new(store: Arc<dyn BitStore>, total_bits: TotalBits, options: FanoutOptions) -> Self {
        let (broadcaster, _) = broadcast::channel(options.client_buffer.max(1));

        Self {
            store,
            total_bits,
            options,
            broadcaster,
        }
    }

    /// Subscribe to the store and spawn the drain and resync tasks.
    ///
    /// The subscription is opened before returning, so every toggle published
    /// after this call reaches the drain task.
    pub async fn start(&self) -> Result<FanoutHandle, BitswarmError> {
        let subscription = self.store.subscribe().await?;

        let drain = tokio::spawn(self.clone().drain_loop(subscription));
        let resync = tokio::spawn(self.clone().resync_loop());

        tracing::info!(
            drain_interval_ms = self.options.drain_interval.as_millis() as u64,
            max_batch_events = self.options.max_batch_events,
            snapshot_interval_ms = self.options.snapshot_interval.as_millis() as u64,
            "Fanout started"
        );

        Ok(FanoutHandle { drain, resync })
    } // end method start

    /// Attach a client.
    ///
    /// The broadcast receiver is created before the snapshot is read, so the
    /// client misses nothing between the two. Batches it receives may already
    /// be reflected in the snapshot; applying them again is idempotent.
    pub async fn connect_client(&self) -> Result<ClientFeed, BitswarmError> {
        let receiver = self.broadcaster.subscribe();
        let snapshot = self.store.snapshot().await?;

        Ok(ClientFeed { snapshot, receiver })
    }

    /// Receive broadcasts without an initial snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.broadcaster.subscribe()
    }

    /// Clients currently attached.
    pub fn client_count(&self) -> usize {
        self.broadcaster.receiver_count()
    }

    /// Fetch a snapshot and broadcast it to every client.
    pub async fn broadcast_snapshot(&self) -> Result<(), BitswarmError> {
        let snapshot = self.store.snapshot().await?;
        let _ = self
            .broadcaster
            .send(Broadcast::FullState(Arc::new(snapshot)));

        Ok(())
    }

    async fn drain_loop(self, subscription: Subscription) {
        let mut subscription = Some(subscription);
        let mut drain_interval = tokio::time::interval(self.options.drain_interval);

        // discard the first tick
        drain_interval.tick().await;

        loop {
            drain_interval.tick().await;

            if subscription.is_none() {
                match self.store.subscribe().await {
                    Ok(resubscribed) => {
                        tracing::info!("Toggle subscription re-established");
                        subscription = Some(resubscribed);
                    }
                    Err(err) => {
                        tracing::error!(error = ?err, "Failed to re-establish toggle subscription");
                        continue;
                    }
                }
            }

            let Some(receiver) = subscription.as_mut() else {
                continue;
            };

            let drained = drain(
                receiver,
                self.options.max_batch_events.max(1),
                self.total_bits,
            );

            if drained.disconnected {
                tracing::warn!("Toggle subscription lost, resubscribing on next tick");
                subscription = None;
            }

            if let Some(batch) = drained.batch {
                let _ = self
                    .broadcaster
                    .send(Broadcast::BatchedBitToggles(Arc::new(batch)));
            }
        }
    } // end method drain_loop

    async fn resync_loop(self) {
        let mut snapshot_interval = tokio::time::interval(self.options.snapshot_interval);

        // discard the first tick
        snapshot_interval.tick().await;

        loop {
            snapshot_interval.tick().await;

            if let Err(err) = self.broadcast_snapshot().await {
                tracing::error!(error = ?err, "Failed to broadcast snapshot");
            }
        }
    } // end method resync_loop
} // end impl FanoutCoordinator

/// Take up to `max_events` payloads that are already queued.
pub(crate) fn drain(
    receiver: &mut Subscription,
    max_events: usize,
    total_bits: TotalBits,
) -> Drained {
    let mut builder = ToggleBatchBuilder::default();
    let mut drained = Drained::default();
    let mut taken = 0;

    while taken < max_events {
        let payload = match receiver.try_recv() {
            Ok(payload) => payload,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                drained.disconnected = true;
                break;
            }
        };
        taken += 1;

        match ToggleEvent::decode(&payload, total_bits) {
            Ok(event) => builder.push(event),
            Err(err) => {
                tracing::warn!(error = ?err, "Skipping malformed toggle event");
                drained.malformed += 1;
            }
        }
    }

    drained.batch = builder.finish();
    drained
} // end fn drain

/// Running fanout tasks. Dropping the handle stops them.
pub struct FanoutHandle {
    drain: JoinHandle<()>,
    resync: JoinHandle<()>,
}

impl FanoutHandle {
    /// Stop both tasks.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for FanoutHandle {
    fn drop(&mut self) {
        self.drain.abort();
        self.resync.abort();
    }
}
