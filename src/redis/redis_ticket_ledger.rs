use async_trait::async_trait;
use redis::Script;

use crate::{
    BitswarmError, BitswarmRedisClient, RateLimitWindows, RedisKey, RedisKeyGenerator,
    TicketLedger,
};

// KEYS[i] is the ticket set of window i; ARGV = nonce, then (window_ms,
// retained) per window. Timestamps come from Redis so every process shares
// one clock.
const RECORD_SCRIPT: &str = r#"
    local time_array = redis.call("TIME")
    local timestamp_ms = tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)

    local member = tostring(timestamp_ms) .. "-" .. ARGV[1]
    local counts = {}

    for i = 1, #KEYS do
        local tickets_key = KEYS[i]
        local window_ms = tonumber(ARGV[i * 2])
        local retained = tonumber(ARGV[i * 2 + 1])

        redis.call("ZADD", tickets_key, timestamp_ms, member)
        redis.call("ZREMRANGEBYSCORE", tickets_key, "-inf", "(" .. (timestamp_ms - window_ms))
        redis.call("ZREMRANGEBYRANK", tickets_key, 0, -(retained + 1))
        counts[i] = redis.call("ZCARD", tickets_key)
        redis.call("PEXPIRE", tickets_key, window_ms)
    end

    return counts
"#;

/// Redis-backed sliding-window ticket ledger.
///
/// Each `(client, window)` pair is a sorted set of tickets scored by Redis
/// server time. All windows of a call are recorded by one Lua script, so
/// concurrent front-end processes see one consistent ledger. Sets expire on
/// their own once a client goes quiet.
pub struct RedisTicketLedger {
    client: BitswarmRedisClient,
    key_generator: RedisKeyGenerator,
    record_script: Script,
}

impl RedisTicketLedger {
    /// Create a ledger writing to `client`, usually the primary.
    pub fn new(client: BitswarmRedisClient, prefix: Option<RedisKey>) -> Self {
        Self {
            client,
            key_generator: RedisKeyGenerator::new(
                prefix.unwrap_or_else(RedisKey::default_prefix),
            ),
            record_script: Script::new(RECORD_SCRIPT),
        }
    }
}

#[async_trait]
impl TicketLedger for RedisTicketLedger {
    async fn record(
        &self,
        key: &str,
        windows: &RateLimitWindows,
    ) -> Result<Vec<u64>, BitswarmError> {
        let mut invocation = self.record_script.prepare_invoke();
        invocation.arg(rand::random::<u64>());

        for window in windows.iter() {
            invocation
                .key(
                    self.key_generator
                        .get_ticket_key(key, *window.window_size_seconds),
                )
                .arg(window.window_size_seconds.as_millis())
                .arg(window.retained_tickets());
        }

        let mut connection_manager = self.client.get();
        let counts: Vec<u64> = invocation.invoke_async(&mut connection_manager).await?;

        if counts.len() != windows.len() {
            return Err(BitswarmError::UnexpectedReply(format!(
                "expected {} window counts, got {}",
                windows.len(),
                counts.len()
            )));
        }

        Ok(counts)
    } // end method record

    async fn cleanup(&self, _stale_after_ms: u64) -> Result<(), BitswarmError> {
        // Ticket sets carry their own expiry.
        Ok(())
    }
}
