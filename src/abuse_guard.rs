use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use dashmap::DashMap;

/// Configuration for [`AbuseGuard`].
#[derive(Clone, Debug)]
pub struct AbuseGuardOptions {
    /// Requests an origin may make before suppression starts.
    pub max_requests: u64,
    /// Each forgiveness pass subtracts `max_requests * mercy_ratio`.
    pub mercy_ratio: u64,
    /// Interval between forgiveness passes.
    pub reset_interval: Duration,
    /// Requests over the threshold that halve the admission probability.
    pub decay_scale: u64,
}

impl Default for AbuseGuardOptions {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            mercy_ratio: 8,
            reset_interval: Duration::from_secs(60),
            decay_scale: 2500,
        }
    }
}

/// Aggregate counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AbuseStats {
    /// Origins currently tracked.
    pub tracked_origins: usize,
    /// Sum of all tracked counters.
    pub total_requests: u64,
}

/// Probabilistic, process-local suppression of abusive origins.
///
/// Sits in front of the sliding windows as a coarse outer tier. Every request
/// (connection attempt or toggle) bumps the origin's counter. Below
/// `max_requests` the origin is always admitted; above it, admission becomes a
/// coin flip with probability `0.5^(count / decay_scale)`, so persistent
/// abusers fade out rather than hitting a cliff. A periodic forgiveness pass
/// lowers every counter.
///
/// Counters are not shared across processes.
pub struct AbuseGuard {
    options: AbuseGuardOptions,
    counters: DashMap<String, AtomicU64>,
}

impl AbuseGuard {
    /// Create an empty guard.
    pub fn new(options: AbuseGuardOptions) -> Self {
        Self {
            options,
            counters: DashMap::new(),
        }
    }

    /// Count one request from `origin` and decide whether to admit it.
    pub fn admit(&self, origin: &str) -> bool {
        let mut rng = |p: f64| rand::random_bool(p);
        self.admit_with_rng(origin, &mut rng)
    }

    pub(crate) fn admit_with_rng(
        &self,
        origin: &str,
        random_bool: &mut impl FnMut(f64) -> bool,
    ) -> bool {
        let count = match self.counters.get(origin) {
            Some(counter) => counter.fetch_add(1, Ordering::Relaxed) + 1,
            None => self
                .counters
                .entry(origin.to_string())
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed)
                + 1,
        };

        if count < self.options.max_requests {
            return true;
        }

        random_bool(self.admission_probability(count))
    } // end method admit_with_rng

    /// Probability of admitting an origin whose counter is `count`.
    pub fn admission_probability(&self, count: u64) -> f64 {
        if count < self.options.max_requests {
            return 1f64;
        }

        let scale = self.options.decay_scale.max(1) as f64;
        0.5f64.powf(count as f64 / scale).clamp(0f64, 1f64)
    }

    /// One forgiveness pass: lower every counter and forget origins that
    /// reach zero.
    pub fn forgive(&self) {
        let mercy = self
            .options
            .max_requests
            .saturating_mul(self.options.mercy_ratio);

        self.counters.retain(|_, counter| {
            let remaining = counter.load(Ordering::Relaxed).saturating_sub(mercy);
            counter.store(remaining, Ordering::Relaxed);
            remaining > 0
        });
    } // end method forgive

    /// Current counter of `origin`, zero when untracked.
    pub fn requests(&self, origin: &str) -> u64 {
        self.counters
            .get(origin)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Aggregate counters.
    pub fn stats(&self) -> AbuseStats {
        self.counters
            .iter()
            .fold(AbuseStats::default(), |mut stats, counter| {
                stats.tracked_origins += 1;
                stats.total_requests += counter.load(Ordering::Relaxed);
                stats
            })
    }

    pub(crate) fn reset_interval(&self) -> Duration {
        self.options.reset_interval
    }
}
