//! Redis-backed event store.
//!
//! Each identifier's log is a sorted set:
//! - Key: configurable prefix + identifier
//! - Member: the event identity
//! - Score: the event timestamp in microseconds since the Unix epoch
//!
//! Scores are doubles, which represent integers exactly only up to 2^53.
//! Nanosecond scores would lose precision, so scores are stored in
//! microseconds; eviction and range bounds therefore act at microsecond
//! granularity while members keep the full nanosecond timestamp.
//!
//! Transactions run as `MULTI`/`EXEC` pipelines. The counting variant runs
//! the same steps plus `ZCOUNT` inside one Lua script, so no other client can
//! interleave between the mutation and the count.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use super::{Event, EventStore, StoreOp, Transaction, TransactionOutcome};
use crate::clock::Timestamp;
use crate::error::{Result, SlidelogError};

/// Applies a list of `(op, a, b)` argument triples, then counts `[lo, hi]`.
/// The last two ARGV entries are the count bounds.
const UNIFIED_SCRIPT: &str = r#"
local key = KEYS[1]
local evicted = 0
local inserted = 0
local last = #ARGV - 2
for i = 1, last, 3 do
  local op = ARGV[i]
  if op == 'evict' then
    evicted = evicted + redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. ARGV[i + 1])
  elseif op == 'insert' then
    inserted = inserted + redis.call('ZADD', key, ARGV[i + 1], ARGV[i + 2])
  elseif op == 'expire' then
    redis.call('PEXPIRE', key, ARGV[i + 1])
  end
end
local count = redis.call('ZCOUNT', key, ARGV[#ARGV - 1], ARGV[#ARGV])
return {evicted, inserted, count}
"#;

/// Configuration for the Redis event store.
#[derive(Debug, Clone)]
pub struct RedisEventStoreConfig {
    /// Prefix prepended to every identifier (default: "slidelog:")
    pub key_prefix: String,
    /// Upper bound on every round trip (default: 1 second)
    pub response_timeout: Duration,
}

impl Default for RedisEventStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "slidelog:".to_string(),
            response_timeout: Duration::from_secs(1),
        }
    }
}

/// Event store backed by Redis sorted sets.
///
/// Cloning is cheap; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisEventStore {
    connection: ConnectionManager,
    config: RedisEventStoreConfig,
    unified: Script,
}

impl fmt::Debug for RedisEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn score(timestamp: Timestamp) -> i64 {
    timestamp.as_unix_micros()
}

/// `ZREMRANGEBYSCORE` upper bound excluding `cutoff` itself.
fn exclusive(cutoff: Timestamp) -> String {
    format!("({}", score(cutoff))
}

fn ttl_millis(ttl: Duration) -> i64 {
    // Round up so the key outlives the window; PEXPIRE 0 deletes it outright.
    i64::try_from(ttl.as_nanos().div_ceil(1_000_000))
        .unwrap_or(i64::MAX)
        .max(1)
}

impl RedisEventStore {
    /// Connect with the default configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisEventStoreConfig::default()).await
    }

    /// Connect with a custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisEventStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(
            config.response_timeout,
            ConnectionManager::new(client),
        )
        .await??;

        info!(key_prefix = %config.key_prefix, "Connected to Redis event store");

        Ok(Self {
            connection,
            config,
            unified: Script::new(UNIFIED_SCRIPT),
        })
    }

    /// The Redis key holding the log of `identifier`.
    pub fn key(&self, identifier: &str) -> String {
        format!("{}{}", self.config.key_prefix, identifier)
    }

    /// Await a Redis call, bounded by the response timeout.
    async fn timed<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        Ok(tokio::time::timeout(self.config.response_timeout, call).await??)
    }

    /// Delete the log of `identifier`. Mostly useful for tests.
    pub async fn clear(&self, identifier: &str) -> Result<()> {
        let key = self.key(identifier);
        let mut conn = self.connection.clone();
        let _: () = self.timed(conn.del(&key)).await?;
        Ok(())
    }

    /// Remaining time to live of the log of `identifier`, if it has one.
    pub async fn ttl(&self, identifier: &str) -> Result<Option<Duration>> {
        let key = self.key(identifier);
        let mut conn = self.connection.clone();
        let millis: i64 = self.timed(conn.pttl(&key)).await?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }
}

fn outcome_from_replies(transaction: &Transaction, replies: &[i64]) -> TransactionOutcome {
    let mut outcome = TransactionOutcome::default();
    for (op, reply) in transaction.ops().iter().zip(replies) {
        let reply = u64::try_from(*reply).unwrap_or(0);
        match op {
            StoreOp::EvictBefore(_) => outcome.evicted += reply,
            StoreOp::Insert(_) => outcome.inserted += reply,
            StoreOp::SetExpiry(_) => {}
        }
    }
    outcome
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn evict_before(&self, key: &str, cutoff: Timestamp) -> Result<u64> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.timed(conn.zrembyscore(&key, "-inf", exclusive(cutoff)))
            .await
    }

    async fn insert(&self, key: &str, event: &Event) -> Result<bool> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        let added: u64 = self
            .timed(conn.zadd(&key, event.id(), score(event.timestamp())))
            .await?;
        Ok(added > 0)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        let _: bool = self.timed(conn.pexpire(&key, ttl_millis(ttl))).await?;
        Ok(())
    }

    async fn count_range(&self, key: &str, lo: Timestamp, hi: Timestamp) -> Result<u64> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.timed(conn.zcount(&key, score(lo), score(hi))).await
    }

    async fn run_atomically(
        &self,
        key: &str,
        transaction: &Transaction,
    ) -> Result<TransactionOutcome> {
        if transaction.is_empty() {
            return Ok(TransactionOutcome::default());
        }

        let key = self.key(key);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in transaction.ops() {
            match op {
                StoreOp::EvictBefore(cutoff) => {
                    pipe.zrembyscore(&key, "-inf", exclusive(*cutoff));
                }
                StoreOp::Insert(event) => {
                    pipe.zadd(&key, event.id(), score(event.timestamp()));
                }
                StoreOp::SetExpiry(ttl) => {
                    pipe.pexpire(&key, ttl_millis(*ttl));
                }
            }
        }

        let mut conn = self.connection.clone();
        let replies: Vec<i64> = self.timed(pipe.query_async(&mut conn)).await?;
        if replies.len() != transaction.ops().len() {
            return Err(SlidelogError::StoreUnavailable(format!(
                "transaction returned {} replies for {} steps",
                replies.len(),
                transaction.ops().len()
            )));
        }

        Ok(outcome_from_replies(transaction, &replies))
    }

    fn supports_unified_count(&self) -> bool {
        true
    }

    async fn run_atomically_counting(
        &self,
        key: &str,
        transaction: &Transaction,
        lo: Timestamp,
        hi: Timestamp,
    ) -> Result<(TransactionOutcome, u64)> {
        let key = self.key(key);
        let mut invocation = self.unified.prepare_invoke();
        invocation.key(&key);
        for op in transaction.ops() {
            match op {
                StoreOp::EvictBefore(cutoff) => {
                    invocation.arg("evict").arg(score(*cutoff)).arg(0);
                }
                StoreOp::Insert(event) => {
                    invocation
                        .arg("insert")
                        .arg(score(event.timestamp()))
                        .arg(event.id());
                }
                StoreOp::SetExpiry(ttl) => {
                    invocation.arg("expire").arg(ttl_millis(*ttl)).arg(0);
                }
            }
        }
        invocation.arg(score(lo)).arg(score(hi));

        let mut conn = self.connection.clone();
        let reply: (i64, i64, i64) = self.timed(invocation.invoke_async(&mut conn)).await?;
        let (evicted, inserted, count) = reply;
        debug!(key = %key, evicted, inserted, count, "Ran unified transaction");

        let outcome = TransactionOutcome {
            evicted: u64::try_from(evicted).unwrap_or(0),
            inserted: u64::try_from(inserted).unwrap_or(0),
        };
        Ok((outcome, u64::try_from(count).unwrap_or(0)))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let pong: String = self.timed(redis::cmd("PING").query_async(&mut conn)).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(SlidelogError::StoreUnavailable(format!(
                "unexpected PING reply: {}",
                pong
            )))
        }
    }
}
