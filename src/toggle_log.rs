//! Best-effort, batched audit log of accepted toggles.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{BitStore, BitswarmError};

/// Configuration for the toggle log.
#[derive(Clone, Debug)]
pub struct ToggleLogOptions {
    /// Queue length between toggles and the writer. Entries are dropped while
    /// it is full.
    pub channel_capacity: usize,
    /// Longest time an entry waits before being written.
    pub max_interval: Duration,
    /// Queued entries that trigger an immediate write.
    pub max_batch: usize,
    /// Entries kept per daily bucket. Later entries of the day are discarded.
    pub max_entries_per_day: u64,
}

impl Default for ToggleLogOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 20,
            max_interval: Duration::from_secs(5),
            max_batch: 200,
            max_entries_per_day: 400_000_000,
        }
    }
}

/// One accepted toggle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToggleLogEntry {
    /// Origin key of the requester.
    pub origin: String,
    /// Toggled bit.
    pub index: u64,
    /// Value after the toggle.
    pub new_value: bool,
    /// Commit time in wall-clock milliseconds.
    pub timestamp_ms: u64,
}

impl ToggleLogEntry {
    fn timestamp(&self) -> DateTime<Utc> {
        i64::try_from(self.timestamp_ms)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default()
    }

    /// UTC day the entry belongs to, `YYYY-MM-DD`.
    pub fn bucket(&self) -> String {
        self.timestamp().format("%Y-%m-%d").to_string()
    }

    /// Stored form: `YYYY-MM-DD HH:MM:SS|origin|index|0|1`.
    pub fn to_record(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.timestamp().format("%Y-%m-%d %H:%M:%S"),
            self.origin,
            self.index,
            u8::from(self.new_value)
        )
    }
}

/// Producer side of the toggle log. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ToggleLogSender {
    tx: mpsc::Sender<ToggleLogEntry>,
}

impl ToggleLogSender {
    /// Queue an entry without waiting. Returns `false` if it was dropped.
    pub fn record(&self, entry: ToggleLogEntry) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(TrySendError::Full(entry)) => {
                tracing::debug!(index = entry.index, "Toggle log queue full, dropping entry");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Consumer side of the toggle log: batches entries and appends them to the
/// store.
pub struct ToggleLogWriter {
    rx: mpsc::Receiver<ToggleLogEntry>,
    options: ToggleLogOptions,
}

impl ToggleLogWriter {
    /// Create a connected sender and writer.
    pub fn channel(options: ToggleLogOptions) -> (ToggleLogSender, Self) {
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));

        (ToggleLogSender { tx }, Self { rx, options })
    }

    /// Spawn the writer loop.
    ///
    /// Entries are written when `max_batch` are queued or `max_interval` has
    /// passed, whichever comes first. A failed write is logged and its entries
    /// are discarded. The loop exits once every sender is gone and the queue
    /// is drained.
    pub fn run(self, store: Arc<dyn BitStore>) -> JoinHandle<()> {
        let ToggleLogWriter { mut rx, options } = self;
        let max_batch = options.max_batch.max(1);

        tokio::spawn(async move {
            let mut flush_interval = tokio::time::interval(options.max_interval);
            let mut batch: Vec<ToggleLogEntry> = Vec::with_capacity(max_batch);

            // discard the first tick
            flush_interval.tick().await;

            loop {
                let mut closed = false;

                tokio::select! {
                    _ = flush_interval.tick() => {
                        if batch.is_empty() {
                            continue;
                        }
                    },
                    entry = rx.recv() => {
                        match entry {
                            Some(entry) => batch.push(entry),
                            None => closed = true,
                        }

                        while batch.len() < max_batch
                            && let Ok(entry) = rx.try_recv()
                        {
                            batch.push(entry);
                        }

                        if !closed && batch.len() < max_batch {
                            continue;
                        }
                    }
                }

                if !batch.is_empty() {
                    if let Err(err) =
                        Self::flush(&*store, &batch, options.max_entries_per_day).await
                    {
                        tracing::error!(error = ?err, entries = batch.len(), "Failed to write toggle log");
                    }

                    batch.clear();
                }

                if closed {
                    break;
                }
            }
        })
    } // end method run

    async fn flush(
        store: &dyn BitStore,
        batch: &[ToggleLogEntry],
        max_entries_per_day: u64,
    ) -> Result<(), BitswarmError> {
        let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for entry in batch {
            buckets
                .entry(entry.bucket())
                .or_default()
                .push(entry.to_record());
        }

        tracing::info!(entries = batch.len(), "Submitting toggle log");

        for (bucket, records) in buckets {
            store
                .append_toggle_log(&bucket, &records, max_entries_per_day)
                .await?;
        }

        Ok(())
    } // end method flush
} // end impl ToggleLogWriter
