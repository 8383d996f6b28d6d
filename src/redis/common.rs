use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use redis::{Client, aio::ConnectionManager};

use crate::BitswarmError;

/// A small pool of [`redis::aio::ConnectionManager`]s for one Redis endpoint.
///
/// Every operation takes a connection with [`get`](Self::get) and drops it when
/// done; managers reconnect on their own after a failure.
#[derive(Debug)]
pub struct BitswarmRedisClient {
    client: Client,
    connection_managers: Arc<Vec<ConnectionManager>>,
    track_index: AtomicUsize,
}

impl BitswarmRedisClient {
    /// Create a client holding a single connection manager.
    pub async fn default_from_client(client: Client) -> Result<Self, BitswarmError> {
        Self::from_client(client, 1).await
    }

    /// Create a client holding `connection_count` connection managers.
    pub async fn from_client(
        client: Client,
        connection_count: usize,
    ) -> Result<Self, BitswarmError> {
        if connection_count == 0 {
            return Err(BitswarmError::InvalidRedisClientConnectionCount(
                "connection count must be > 0".to_string(),
            ));
        }

        let mut connection_managers = Vec::with_capacity(connection_count);

        for _ in 0..connection_count {
            connection_managers.push(client.get_connection_manager().await?);
        }

        Ok(Self {
            client,
            connection_managers: Arc::new(connection_managers),
            track_index: AtomicUsize::new(0),
        })
    }

    /// Open a client from a `redis://` URL.
    pub async fn open(url: &str, connection_count: usize) -> Result<Self, BitswarmError> {
        Self::from_client(Client::open(url)?, connection_count).await
    }

    /// Take a pooled connection, round robin.
    pub(crate) fn get(&self) -> ConnectionManager {
        let index = self.track_index.fetch_add(1, Ordering::Relaxed);
        self.connection_managers[index % self.connection_managers.len()].clone()
    } // end method get

    /// Underlying client, used for dedicated pub/sub connections.
    pub(crate) fn client(&self) -> &Client {
        &self.client
    }
} // end impl BitswarmRedisClient

impl Clone for BitswarmRedisClient {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            connection_managers: self.connection_managers.clone(),
            track_index: AtomicUsize::new(0),
        }
    }
}

/// A validated newtype for Redis key prefixes.
///
/// This is a string with the following constraints:
/// - Must not be empty
/// - Must not be longer than 255 bytes
/// - Must not contain colons
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct RedisKey(Arc<str>);

impl RedisKey {
    /// The default prefix, `bitswarm`.
    pub fn default_prefix() -> Self {
        Self(Arc::from("bitswarm"))
    }
}

impl Deref for RedisKey {
    type Target = Arc<str>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for RedisKey {
    type Error = BitswarmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(BitswarmError::InvalidRedisKey(
                "Redis key must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(BitswarmError::InvalidRedisKey(
                "Redis key must not be longer than 255 characters".to_string(),
            ))
        } else if value.contains(':') {
            Err(BitswarmError::InvalidRedisKey(
                "Redis key must not contain colons".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

/// Builds every key this crate touches under one prefix.
///
/// Layout:
/// - `<prefix>:bitset`: raw bitset blob
/// - `<prefix>:count`: aggregate set-bit count
/// - `<prefix>:toggles`: pub/sub channel for toggle events
/// - `<prefix>:logs:<YYYY-MM-DD>`: daily toggle log list
/// - `<prefix>:rl:<client>:<seconds>`: rate-limit tickets (sorted set)
#[derive(Clone, Debug)]
pub(crate) struct RedisKeyGenerator {
    pub prefix: RedisKey,
    bitset_key: Arc<str>,
    count_key: Arc<str>,
    toggle_channel: Arc<str>,
}

impl RedisKeyGenerator {
    pub(crate) fn new(prefix: RedisKey) -> Self {
        Self {
            bitset_key: Arc::from(format!("{}:bitset", *prefix)),
            count_key: Arc::from(format!("{}:count", *prefix)),
            toggle_channel: Arc::from(format!("{}:toggles", *prefix)),
            prefix,
        }
    }

    pub(crate) fn get_bitset_key(&self) -> &str {
        &self.bitset_key
    }

    pub(crate) fn get_count_key(&self) -> &str {
        &self.count_key
    }

    pub(crate) fn get_toggle_channel(&self) -> &str {
        &self.toggle_channel
    }

    pub(crate) fn get_log_key(&self, bucket: &str) -> String {
        format!("{}:logs:{}", *self.prefix, bucket)
    }

    /// Client keys are not cached: their cardinality is unbounded.
    pub(crate) fn get_ticket_key(&self, client_key: &str, window_size_seconds: u64) -> String {
        format!("{}:rl:{}:{}", *self.prefix, client_key, window_size_seconds)
    }
}
