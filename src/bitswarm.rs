use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::{
    AbuseGuard, AbuseGuardOptions, BitIndex, BitStore, BitswarmError, CapacityCap, ClientFeed,
    ClientKey, FanoutCoordinator, FanoutHandle, FanoutOptions, LocalBitStore,
    LocalBitStoreOptions, LocalTicketLedger, RateLimitDecision, RateLimitWindows, RateLimiter,
    Snapshot, TicketLedger, ToggleEvent, ToggleLogEntry, ToggleLogOptions, ToggleLogSender,
    ToggleLogWriter, TotalBits, common::now_ms,
};

#[cfg(feature = "redis")]
use crate::{
    BitswarmRedisClient, RedisBitStore, RedisBitStoreOptions, RedisKey, RedisTicketLedger,
};

/// Where the bitset, the toggle channel and the rate-limit tickets live.
///
/// Chosen once in [`Bitswarm::new`]; every later operation goes through the
/// [`BitStore`] and [`TicketLedger`] it produced.
#[derive(Clone, Debug, Default)]
pub enum BackendOptions {
    /// Everything in this process. Nothing is shared or persisted.
    #[default]
    Local,
    /// Shared state in Redis.
    #[cfg(feature = "redis")]
    Redis {
        /// Connections to the primary. Every write goes here.
        primary: BitswarmRedisClient,
        /// Connections to a read replica, if any.
        replica: Option<BitswarmRedisClient>,
        /// Key prefix. Defaults to `"bitswarm"`.
        prefix: Option<RedisKey>,
    },
}

/// Configuration for [`Bitswarm`].
#[derive(Clone, Debug)]
pub struct BitswarmOptions {
    /// Storage backend.
    pub backend: BackendOptions,
    /// Size of the bitset.
    pub total_bits: TotalBits,
    /// Maximum number of set bits. Defaults to `total_bits`.
    pub capacity: Option<CapacityCap>,
    /// Sliding windows applied to every origin.
    pub rate_limit: RateLimitWindows,
    /// Batching and resync cadence.
    pub fanout: FanoutOptions,
    /// Outer abuse tier.
    pub abuse: AbuseGuardOptions,
    /// Toggle audit log. `None` disables it.
    pub toggle_log: Option<ToggleLogOptions>,
    /// How often idle rate-limit keys are evicted.
    pub ledger_cleanup_interval: Duration,
    /// Queue length between the store's toggle channel and the fanout.
    pub subscription_capacity: usize,
}

impl Default for BitswarmOptions {
    fn default() -> Self {
        Self {
            backend: BackendOptions::default(),
            total_bits: TotalBits::default(),
            capacity: None,
            rate_limit: RateLimitWindows::default(),
            fanout: FanoutOptions::default(),
            abuse: AbuseGuardOptions::default(),
            toggle_log: Some(ToggleLogOptions::default()),
            ledger_cleanup_interval: Duration::from_secs(60),
            subscription_capacity: 4096,
        }
    }
}

impl BitswarmOptions {
    fn capacity(&self) -> CapacityCap {
        self.capacity
            .unwrap_or_else(|| CapacityCap::from(self.total_bits))
    }
}

/// What happened to a toggle request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleDecision {
    /// The bit flipped and the event was published.
    Applied(ToggleEvent),
    /// Setting the bit would exceed the capacity cap. Nothing changed.
    CapacityReached {
        /// Requested bit.
        index: u64,
        /// Its unchanged value.
        value: bool,
    },
    /// A sliding window rejected the origin.
    RateLimited {
        /// Size of the rejecting window.
        window_size_seconds: u64,
        /// Its limit.
        limit: u64,
    },
    /// The abuse guard dropped the request.
    Suppressed,
}

/// The toggle service: one per process, shared by every connection.
///
/// # Examples
///
/// ```ignore
/// let swarm = Arc::new(Bitswarm::new(BitswarmOptions::default()).await?);
/// let _handle = swarm.start().await?;
///
/// let origin = ClientKey::from_ip("203.0.113.7".parse()?);
/// match swarm.toggle(&origin, 42).await? {
///     ToggleDecision::Applied(event) => println!("bit 42 is now {}", event.new_value),
///     other => println!("not applied: {other:?}"),
/// }
/// ```
pub struct Bitswarm {
    store: Arc<dyn BitStore>,
    limiter: RateLimiter,
    abuse_guard: Arc<AbuseGuard>,
    fanout: FanoutCoordinator,
    total_bits: TotalBits,
    toggle_log: Option<ToggleLogSender>,
    log_writer: Mutex<Option<ToggleLogWriter>>,
    ledger_cleanup_interval: Duration,
}

impl Bitswarm {
    /// Build the backend selected in `options` and the service around it.
    pub async fn new(options: BitswarmOptions) -> Result<Self, BitswarmError> {
        let capacity = options.capacity();

        let (store, ledger): (Arc<dyn BitStore>, Arc<dyn TicketLedger>) = match &options.backend {
            BackendOptions::Local => (
                Arc::new(LocalBitStore::new(LocalBitStoreOptions {
                    total_bits: options.total_bits,
                    capacity,
                    subscription_capacity: options.subscription_capacity,
                })),
                Arc::new(LocalTicketLedger::new()),
            ),
            #[cfg(feature = "redis")]
            BackendOptions::Redis {
                primary,
                replica,
                prefix,
            } => {
                let store = RedisBitStore::connect(RedisBitStoreOptions {
                    primary: primary.clone(),
                    replica: replica.clone(),
                    prefix: prefix.clone(),
                    total_bits: options.total_bits,
                    capacity,
                    subscription_capacity: options.subscription_capacity,
                })
                .await?;

                (
                    Arc::new(store),
                    Arc::new(RedisTicketLedger::new(primary.clone(), prefix.clone())),
                )
            }
        };

        tracing::info!(
            total_bits = *options.total_bits,
            capacity = *capacity,
            windows = options.rate_limit.len(),
            "Bitswarm backend ready"
        );

        Ok(Self::with_parts(store, ledger, options))
    } // end constructor

    /// Build the service around an existing store and ledger.
    ///
    /// `options.backend` and `options.capacity` are ignored; the store
    /// enforces its own cap.
    pub fn with_parts(
        store: Arc<dyn BitStore>,
        ledger: Arc<dyn TicketLedger>,
        options: BitswarmOptions,
    ) -> Self {
        let (toggle_log, log_writer) = match options.toggle_log {
            Some(log_options) => {
                let (sender, writer) = ToggleLogWriter::channel(log_options);
                (Some(sender), Some(writer))
            }
            None => (None, None),
        };

        Self {
            fanout: FanoutCoordinator::new(store.clone(), options.total_bits, options.fanout),
            limiter: RateLimiter::new(ledger, options.rate_limit),
            abuse_guard: Arc::new(AbuseGuard::new(options.abuse)),
            store,
            total_bits: options.total_bits,
            toggle_log,
            log_writer: Mutex::new(log_writer),
            ledger_cleanup_interval: options.ledger_cleanup_interval,
        }
    }

    /// Spawn the background tasks: fanout drain and resync, abuse
    /// forgiveness, idle ticket eviction and the toggle log writer.
    ///
    /// Dropping the returned handle stops them. The toggle log writer is
    /// handed to the first call only.
    pub async fn start(&self) -> Result<BitswarmHandle, BitswarmError> {
        let fanout = self.fanout.start().await?;
        let mut tasks = Vec::with_capacity(3);

        let abuse_guard = self.abuse_guard.clone();
        tasks.push(tokio::spawn(async move {
            let mut reset_interval = tokio::time::interval(abuse_guard.reset_interval());

            // discard the first tick
            reset_interval.tick().await;

            loop {
                reset_interval.tick().await;
                abuse_guard.forgive();

                let stats = abuse_guard.stats();
                tracing::debug!(
                    tracked_origins = stats.tracked_origins,
                    total_requests = stats.total_requests,
                    "Abuse counters forgiven"
                );
            }
        }));

        let ledger = self.limiter.ledger().clone();
        let stale_after_ms = self.limiter.windows().longest_ms();
        let cleanup_interval = self.ledger_cleanup_interval;
        tasks.push(tokio::spawn(async move {
            let mut cleanup_interval = tokio::time::interval(cleanup_interval);

            // discard the first tick
            cleanup_interval.tick().await;

            loop {
                cleanup_interval.tick().await;

                if let Err(err) = ledger.cleanup(stale_after_ms).await {
                    tracing::error!(error = ?err, "Failed to evict idle rate limit keys");
                }
            }
        }));

        if let Some(writer) = self.log_writer.lock().take() {
            tasks.push(writer.run(self.store.clone()));
        }

        Ok(BitswarmHandle {
            _fanout: fanout,
            tasks,
        })
    } // end method start

    /// Run one toggle request from `origin`.
    ///
    /// Checks, in order: the abuse guard, the index, the sliding windows and
    /// the capacity cap. Only an applied toggle is published and logged.
    /// Out-of-range indices and store failures are errors; the other
    /// rejections are [`ToggleDecision`] variants.
    pub async fn toggle(
        &self,
        origin: &ClientKey,
        index: i64,
    ) -> Result<ToggleDecision, BitswarmError> {
        if !self.abuse_guard.admit(origin) {
            tracing::debug!(origin = %origin, index, "Toggle suppressed by abuse guard");
            return Ok(ToggleDecision::Suppressed);
        }

        let index = BitIndex::new(index, self.total_bits)?;

        if let RateLimitDecision::Rejected {
            window_size_seconds,
            limit,
            observed,
        } = self.limiter.is_allowed(origin).await?
        {
            tracing::debug!(
                origin = %origin,
                index = *index,
                window_size_seconds,
                limit,
                observed,
                "Toggle rate limited"
            );
            return Ok(ToggleDecision::RateLimited {
                window_size_seconds,
                limit,
            });
        }

        let outcome = self.store.toggle(index).await?;

        if !outcome.changed {
            tracing::debug!(index = *index, "Toggle rejected at capacity");
            return Ok(ToggleDecision::CapacityReached {
                index: *index,
                value: outcome.value,
            });
        }

        let event = ToggleEvent {
            index: *index,
            new_value: outcome.value,
            timestamp_ms: now_ms(),
        };

        if let Err(err) = self.store.publish(&event).await {
            tracing::error!(error = ?err, index = *index, "Failed to publish toggle event");
        }

        if let Some(toggle_log) = &self.toggle_log {
            toggle_log.record(ToggleLogEntry {
                origin: origin.to_string(),
                index: event.index,
                new_value: event.new_value,
                timestamp_ms: event.timestamp_ms,
            });
        }

        Ok(ToggleDecision::Applied(event))
    } // end method toggle

    /// Count a connection attempt against the abuse guard.
    pub fn admit_connection(&self, origin: &ClientKey) -> bool {
        let admitted = self.abuse_guard.admit(origin);

        if !admitted {
            tracing::debug!(origin = %origin, "Connection suppressed by abuse guard");
        }

        admitted
    }

    /// Attach a client: its first snapshot plus every later broadcast.
    pub async fn connect_client(&self) -> Result<ClientFeed, BitswarmError> {
        self.fanout.connect_client().await
    }

    /// Full snapshot from the read path.
    pub async fn snapshot(&self) -> Result<Snapshot, BitswarmError> {
        self.store.snapshot().await
    }

    /// Aggregate set-bit count from the read path.
    pub async fn count(&self) -> Result<u64, BitswarmError> {
        self.store.count().await
    }

    /// Read one bit from the read path.
    pub async fn get_bit(&self, index: i64) -> Result<bool, BitswarmError> {
        self.store
            .get_bit(BitIndex::new(index, self.total_bits)?)
            .await
    }

    /// Size of the bitset.
    pub fn total_bits(&self) -> TotalBits {
        self.total_bits
    }

    /// The fanout coordinator.
    pub fn fanout(&self) -> &FanoutCoordinator {
        &self.fanout
    }

    /// The abuse guard.
    pub fn abuse_guard(&self) -> &AbuseGuard {
        &self.abuse_guard
    }

    /// The sliding-window limiter.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }
} // end impl Bitswarm

/// Background tasks of a started [`Bitswarm`]. Dropping it stops them.
pub struct BitswarmHandle {
    _fanout: FanoutHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl BitswarmHandle {
    /// Stop every background task.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for BitswarmHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
