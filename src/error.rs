/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum BitswarmError {
    /// Redis error.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Invalid total bit count.
    #[error("invalid total bits: {0}")]
    InvalidTotalBits(String),

    /// Invalid sliding window size.
    #[error("invalid window size: {0}")]
    InvalidWindowSize(String),

    /// Invalid sliding window limit.
    #[error("invalid window limit: {0}")]
    InvalidWindowLimit(String),

    /// Invalid Redis key.
    #[error("invalid redis key: {0}")]
    InvalidRedisKey(String),

    /// Invalid number of pooled Redis connections.
    #[error("invalid redis client connection count: {0}")]
    InvalidRedisClientConnectionCount(String),

    /// A toggle targeted an index outside of the bitset.
    #[error("index {index} is out of range for {total_bits} bits")]
    IndexOutOfRange {
        /// Index sent by the caller.
        index: i64,
        /// Size of the bitset.
        total_bits: u64,
    },

    /// A pub/sub payload could not be decoded into a toggle event.
    #[error("malformed toggle event: {0}")]
    MalformedEvent(String),

    /// A snapshot payload could not be decoded.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    /// The store returned something the toggle protocol does not produce.
    #[error("unexpected store reply: {0}")]
    UnexpectedReply(String),
}
