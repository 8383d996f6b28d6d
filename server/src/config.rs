use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;
use clap::Parser;

use bitswarm::{
    AbuseGuardOptions, BackendOptions, BitswarmOptions, BitswarmRedisClient, CapacityCap,
    DEFAULT_TRUSTED_HEADERS, FanoutOptions, RateLimitWindows, RedisKey, ToggleLogOptions,
    TotalBits,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bitswarm-server",
    about = "Serves a shared bitset over HTTP and WebSocket"
)]
pub struct Config {
    #[arg(long, env = "BITSWARM_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Primary Redis. Without it the state lives in this process only.
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Replica for snapshot reads and pub/sub; falls back to the primary.
    #[arg(long, env = "REDIS_REPLICA_URL")]
    pub redis_replica_url: Option<String>,

    #[arg(long, env = "BITSWARM_PREFIX")]
    pub redis_prefix: Option<String>,

    #[arg(long, env = "BITSWARM_REDIS_POOL_SIZE", default_value_t = 4)]
    pub redis_pool_size: usize,

    #[arg(long, env = "BITSWARM_TOTAL_BITS", default_value_t = 1_000_000)]
    pub total_bits: u64,

    /// Most bits set at once. Defaults to `--total-bits`.
    #[arg(long, env = "BITSWARM_CAPACITY")]
    pub capacity: Option<u64>,

    /// Comma separated `limit/seconds` windows.
    #[arg(long, env = "BITSWARM_RATE_LIMITS", default_value = "7/1,80/15,240/60")]
    pub rate_limits: String,

    #[arg(long, env = "BITSWARM_DRAIN_INTERVAL_MS", default_value_t = 100)]
    pub drain_interval_ms: u64,

    #[arg(long, env = "BITSWARM_MAX_BATCH_EVENTS", default_value_t = 400)]
    pub max_batch_events: usize,

    #[arg(long, env = "BITSWARM_SNAPSHOT_INTERVAL_S", default_value_t = 50)]
    pub snapshot_interval_s: u64,

    #[arg(long, env = "BITSWARM_CLIENT_BUFFER", default_value_t = 256)]
    pub client_buffer: usize,

    #[arg(long, env = "BITSWARM_ABUSE_MAX_REQUESTS", default_value_t = 1_000)]
    pub abuse_max_requests: u64,

    #[arg(long, env = "BITSWARM_ABUSE_MERCY_RATIO", default_value_t = 8)]
    pub abuse_mercy_ratio: u64,

    #[arg(long, env = "BITSWARM_ABUSE_RESET_S", default_value_t = 60)]
    pub abuse_reset_s: u64,

    #[arg(long, env = "BITSWARM_NO_TOGGLE_LOG", default_value_t = false)]
    pub no_toggle_log: bool,

    #[arg(long, env = "BITSWARM_LOG_MAX_BATCH", default_value_t = 200)]
    pub log_max_batch: usize,

    #[arg(long, env = "BITSWARM_LOG_INTERVAL_MS", default_value_t = 5_000)]
    pub log_interval_ms: u64,

    #[arg(long, env = "BITSWARM_LOG_MAX_PER_DAY", default_value_t = 400_000_000)]
    pub log_max_per_day: u64,

    /// Headers carrying the client address, tried in order.
    #[arg(
        long,
        env = "BITSWARM_TRUSTED_HEADERS",
        value_delimiter = ',',
        default_values_t = DEFAULT_TRUSTED_HEADERS.map(String::from)
    )]
    pub trusted_headers: Vec<String>,
}

impl Config {
    pub async fn swarm_options(&self) -> anyhow::Result<BitswarmOptions> {
        let backend = match &self.redis_url {
            None => BackendOptions::Local,
            Some(url) => {
                let primary = BitswarmRedisClient::open(url, self.redis_pool_size)
                    .await
                    .context("connecting to the primary Redis")?;

                let replica = match &self.redis_replica_url {
                    Some(url) => Some(
                        BitswarmRedisClient::open(url, self.redis_pool_size)
                            .await
                            .context("connecting to the replica Redis")?,
                    ),
                    None => None,
                };

                let prefix = self
                    .redis_prefix
                    .clone()
                    .map(RedisKey::try_from)
                    .transpose()?;

                BackendOptions::Redis {
                    primary,
                    replica,
                    prefix,
                }
            }
        };

        let toggle_log = (!self.no_toggle_log).then(|| ToggleLogOptions {
            max_batch: self.log_max_batch,
            max_interval: Duration::from_millis(self.log_interval_ms),
            max_entries_per_day: self.log_max_per_day,
            ..Default::default()
        });

        Ok(BitswarmOptions {
            backend,
            total_bits: TotalBits::try_from(self.total_bits)?,
            capacity: self.capacity.map(CapacityCap::from),
            rate_limit: RateLimitWindows::from_str(&self.rate_limits)?,
            fanout: FanoutOptions {
                drain_interval: Duration::from_millis(self.drain_interval_ms),
                max_batch_events: self.max_batch_events,
                snapshot_interval: Duration::from_secs(self.snapshot_interval_s),
                client_buffer: self.client_buffer,
            },
            abuse: AbuseGuardOptions {
                max_requests: self.abuse_max_requests,
                mercy_ratio: self.abuse_mercy_ratio,
                reset_interval: Duration::from_secs(self.abuse_reset_s),
                ..Default::default()
            },
            toggle_log,
            ..Default::default()
        })
    }
}
