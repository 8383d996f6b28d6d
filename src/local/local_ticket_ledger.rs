use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::{BitswarmError, RateLimitWindows, TicketLedger};

/// Tickets for one key, one queue per configured window.
pub(crate) struct TicketSeries {
    pub windows: Vec<VecDeque<Instant>>,
    pub last_seen: Instant,
}

/// In-process sliding-window ticket ledger.
///
/// Keeps per-key state in a [`DashMap`](dashmap::DashMap) and timestamps
/// tickets with tokio's monotonic clock.
///
/// # Semantics & Limitations
///
/// - Tickets are recorded on every call, admitted or not.
/// - Expired tickets are evicted lazily when the key is touched.
/// - Only the newest `limit + 1` tickets per window are kept, which decides
///   every call exactly while bounding memory under a flood.
/// - Keys are not removed on their own; the cleanup loop evicts idle ones.
/// - State is process-scoped and not shared across replicas.
pub struct LocalTicketLedger {
    series: DashMap<String, TicketSeries>,
}

impl LocalTicketLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    fn record_at(&self, key: &str, windows: &RateLimitWindows, now: Instant) -> Vec<u64> {
        let mut series = self
            .series
            .entry(key.to_string())
            .or_insert_with(|| TicketSeries {
                windows: Vec::with_capacity(windows.len()),
                last_seen: now,
            });

        series.windows.resize_with(windows.len(), VecDeque::new);
        series.last_seen = now;

        windows
            .iter()
            .zip(series.windows.iter_mut())
            .map(|(window, tickets)| {
                let window_size = Duration::from_secs(*window.window_size_seconds);

                tickets.push_back(now);

                while let Some(oldest) = tickets.front()
                    && now.saturating_duration_since(*oldest) > window_size
                {
                    tickets.pop_front();
                }

                let retained = window.retained_tickets() as usize;
                while tickets.len() > retained {
                    tickets.pop_front();
                }

                tickets.len() as u64
            })
            .collect()
    } // end method record_at
}

impl Default for LocalTicketLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TicketLedger for LocalTicketLedger {
    async fn record(
        &self,
        key: &str,
        windows: &RateLimitWindows,
    ) -> Result<Vec<u64>, BitswarmError> {
        Ok(self.record_at(key, windows, Instant::now()))
    }

    async fn cleanup(&self, stale_after_ms: u64) -> Result<(), BitswarmError> {
        let stale_after = Duration::from_millis(stale_after_ms);
        let now = Instant::now();

        self.series
            .retain(|_, series| now.saturating_duration_since(series.last_seen) <= stale_after);

        Ok(())
    }
}
