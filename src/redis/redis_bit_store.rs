use async_trait::async_trait;
use futures::StreamExt;
use redis::{FromRedisValue, Script};
use tokio::sync::mpsc;

use crate::{
    BitIndex, BitStore, Bitset, BitswarmError, BitswarmRedisClient, CapacityCap, RedisKey,
    RedisKeyGenerator, Snapshot, Subscription, ToggleEvent, ToggleOutcome, TotalBits,
};

const TOGGLE_SCRIPT: &str = r#"
    local bitset_key = KEYS[1]
    local count_key = KEYS[2]

    local index = tonumber(ARGV[1])
    local capacity = tonumber(ARGV[2])

    local current_count = tonumber(redis.call("GET", count_key)) or 0
    local current_bit = redis.call("GETBIT", bitset_key, index)
    local new_bit = 1 - current_bit
    local diff = new_bit - current_bit

    if diff > 0 and current_count + diff > capacity then
        return {current_bit, 0}
    end

    redis.call("SETBIT", bitset_key, index, new_bit)
    redis.call("SET", count_key, current_count + diff)

    return {new_bit, diff}
"#;

/// Configuration for [`RedisBitStore`].
///
/// # Requirements
///
/// - **Redis version:** >= 6.2.0
/// - **Runtime:** Tokio
///
/// # Examples
///
/// ```ignore
/// let primary = BitswarmRedisClient::open("redis://10.0.0.2:6379/", 8).await?;
/// let replica = BitswarmRedisClient::open("redis://10.0.0.3:6379/", 8).await?;
///
/// let options = RedisBitStoreOptions {
///     primary,
///     replica: Some(replica),
///     prefix: None,
///     total_bits: TotalBits::default(),
///     capacity: CapacityCap::default(),
///     subscription_capacity: 4096,
/// };
/// ```
#[derive(Clone, Debug)]
pub struct RedisBitStoreOptions {
    /// Connections to the primary. Every write goes here.
    pub primary: BitswarmRedisClient,

    /// Connections to a read replica of the primary.
    ///
    /// Snapshots, counts, single-bit reads and subscriptions use it. If `None`,
    /// the primary serves reads as well.
    pub replica: Option<BitswarmRedisClient>,

    /// Optional prefix for all Redis keys. Defaults to `"bitswarm"`.
    pub prefix: Option<RedisKey>,

    /// Size of the bitset.
    pub total_bits: TotalBits,

    /// Maximum number of set bits.
    pub capacity: CapacityCap,

    /// Queue length between the pub/sub connection and its consumer.
    pub subscription_capacity: usize,
}

/// Store backed by a Redis primary and an optional read replica.
///
/// # Consistency Semantics
///
/// - **Toggles:** one Lua script on the primary reads and writes the bit and
///   the count, so the pair never disagrees.
/// - **Snapshots:** bits and count are fetched with a single `MGET`, so they
///   come from the same replica state. That state trails the primary by the
///   replication lag; periodic snapshots bound how long a client sees it.
/// - **Fallback:** a failing replica read is retried once on the primary.
pub struct RedisBitStore {
    primary: BitswarmRedisClient,
    replica: BitswarmRedisClient,
    has_replica: bool,
    key_generator: RedisKeyGenerator,
    toggle_script: Script,
    total_bits: TotalBits,
    capacity: CapacityCap,
    subscription_capacity: usize,
}

impl RedisBitStore {
    /// Connect and make sure the bitset and count exist.
    ///
    /// Existing state is never overwritten, so restarts and additional
    /// processes are safe.
    pub async fn connect(options: RedisBitStoreOptions) -> Result<Self, BitswarmError> {
        let store = Self::new(options);
        store.bootstrap().await?;

        Ok(store)
    }

    pub(crate) fn new(options: RedisBitStoreOptions) -> Self {
        let prefix = options.prefix.unwrap_or_else(RedisKey::default_prefix);
        let has_replica = options.replica.is_some();
        let replica = options.replica.unwrap_or_else(|| options.primary.clone());

        Self {
            primary: options.primary,
            replica,
            has_replica,
            key_generator: RedisKeyGenerator::new(prefix),
            toggle_script: Script::new(TOGGLE_SCRIPT),
            total_bits: options.total_bits,
            capacity: options.capacity,
            subscription_capacity: options.subscription_capacity.max(1),
        }
    } // end constructor

    async fn bootstrap(&self) -> Result<(), BitswarmError> {
        let mut connection_manager = self.primary.get();

        let _: () = redis::pipe()
            .cmd("SET")
            .arg(self.key_generator.get_bitset_key())
            .arg(vec![0u8; self.total_bits.byte_len()])
            .arg("NX")
            .ignore()
            .cmd("SET")
            .arg(self.key_generator.get_count_key())
            .arg(0)
            .arg("NX")
            .ignore()
            .query_async(&mut connection_manager)
            .await?;

        tracing::info!(
            prefix = &**self.key_generator.prefix,
            total_bits = *self.total_bits,
            has_replica = self.has_replica,
            "Redis bit store ready"
        );

        Ok(())
    } // end method bootstrap

    /// Run a read on the replica, retrying on the primary if it fails.
    async fn query_read<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, BitswarmError> {
        let mut replica = self.replica.get();

        match cmd.query_async(&mut replica).await {
            Ok(value) => Ok(value),
            Err(err) if self.has_replica => {
                tracing::warn!(error = ?err, "Replica read failed, falling back to primary");
                let mut primary = self.primary.get();
                Ok(cmd.query_async(&mut primary).await?)
            }
            Err(err) => Err(err.into()),
        }
    } // end method query_read

    async fn open_pubsub(
        &self,
        client: &BitswarmRedisClient,
    ) -> Result<redis::aio::PubSub, BitswarmError> {
        let mut pubsub = client.client().get_async_pubsub().await?;
        pubsub
            .subscribe(self.key_generator.get_toggle_channel())
            .await?;

        Ok(pubsub)
    }
} // end impl RedisBitStore

#[async_trait]
impl BitStore for RedisBitStore {
    async fn get_bit(&self, index: BitIndex) -> Result<bool, BitswarmError> {
        let mut cmd = redis::cmd("GETBIT");
        cmd.arg(self.key_generator.get_bitset_key()).arg(*index);

        let bit: u8 = self.query_read(&cmd).await?;
        Ok(bit != 0)
    }

    async fn toggle(&self, index: BitIndex) -> Result<ToggleOutcome, BitswarmError> {
        let mut connection_manager = self.primary.get();

        let (value, diff): (i64, i64) = self
            .toggle_script
            .key(self.key_generator.get_bitset_key())
            .key(self.key_generator.get_count_key())
            .arg(*index)
            .arg(*self.capacity)
            .invoke_async(&mut connection_manager)
            .await?;

        match diff {
            0 => Ok(ToggleOutcome {
                changed: false,
                value: value != 0,
            }),
            1 | -1 => Ok(ToggleOutcome {
                changed: true,
                value: value != 0,
            }),
            _ => Err(BitswarmError::UnexpectedReply(format!(
                "toggle script returned diff {diff}"
            ))),
        }
    } // end method toggle

    async fn count(&self) -> Result<u64, BitswarmError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.key_generator.get_count_key());

        let count: Option<u64> = self.query_read(&cmd).await?;
        Ok(count.unwrap_or(0))
    }

    async fn snapshot(&self) -> Result<Snapshot, BitswarmError> {
        let mut cmd = redis::cmd("MGET");
        cmd.arg(self.key_generator.get_bitset_key())
            .arg(self.key_generator.get_count_key());

        let (bits, count): (Option<Vec<u8>>, Option<u64>) = self.query_read(&cmd).await?;
        let bits = Bitset::from_bytes(bits.unwrap_or_default(), self.total_bits);

        Ok(Snapshot::encode(bits.as_bytes(), count.unwrap_or(0)))
    } // end method snapshot

    async fn publish(&self, event: &ToggleEvent) -> Result<(), BitswarmError> {
        let mut connection_manager = self.primary.get();

        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.key_generator.get_toggle_channel())
            .arg(event.encode())
            .query_async(&mut connection_manager)
            .await?;

        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription, BitswarmError> {
        let pubsub = match self.open_pubsub(&self.replica).await {
            Ok(pubsub) => pubsub,
            Err(err) if self.has_replica => {
                tracing::warn!(error = ?err, "Replica subscribe failed, falling back to primary");
                self.open_pubsub(&self.primary).await?
            }
            Err(err) => return Err(err),
        };

        let (tx, rx) = mpsc::channel(self.subscription_capacity);

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();

            loop {
                let msg = tokio::select! {
                    msg = messages.next() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = tx.closed() => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = ?err, "Skipping non-text toggle payload");
                        continue;
                    }
                };

                match tx.try_send(payload) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("Toggle subscription full, dropping payload");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }

            tracing::warn!("Toggle subscription connection closed");
        });

        Ok(rx)
    } // end method subscribe

    async fn append_toggle_log(
        &self,
        bucket: &str,
        records: &[String],
        max_entries: u64,
    ) -> Result<(), BitswarmError> {
        if records.is_empty() || max_entries == 0 {
            return Ok(());
        }

        let key = self.key_generator.get_log_key(bucket);
        let mut connection_manager = self.primary.get();

        let _: () = redis::pipe()
            .cmd("RPUSH")
            .arg(&key)
            .arg(records)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(max_entries.saturating_sub(1) as i64)
            .ignore()
            .query_async(&mut connection_manager)
            .await?;

        Ok(())
    } // end method append_toggle_log
}
