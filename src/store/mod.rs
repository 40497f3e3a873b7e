//! Event store contract and adapters.
//!
//! An event store keeps, per key, an ordered log of timestamped events. It
//! supports range eviction, insertion, range counting and whole-key expiry,
//! and can run a sequence of those mutations as one all-or-nothing unit.

mod memory;
mod redis_store;

pub use self::memory::InMemoryEventStore;
pub use self::redis_store::{RedisEventStore, RedisEventStoreConfig};

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Timestamp;
use crate::error::{Result, SlidelogError};

/// One recorded request occurrence.
///
/// Sorted by `timestamp`; identified by `id`, so two events recorded at the
/// same nanosecond remain distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    timestamp: Timestamp,
    id: String,
}

impl Event {
    /// Create an event with an explicit identity.
    pub fn new(timestamp: Timestamp, id: impl Into<String>) -> Self {
        Self {
            timestamp,
            id: id.into(),
        }
    }

    /// The sort key.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The entry identity within a log.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Mints events whose identity is `(timestamp, origin, sequence)`.
///
/// `origin` is random per minter and `sequence` increases monotonically, so
/// identities never collide across processes sharing a store.
#[derive(Debug)]
pub struct EventMinter {
    origin: Uuid,
    sequence: AtomicU64,
}

impl EventMinter {
    /// Create a minter with a fresh random origin.
    pub fn new() -> Self {
        Self {
            origin: Uuid::new_v4(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Mint a new event at `timestamp`.
    pub fn mint(&self, timestamp: Timestamp) -> Event {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        Event::new(
            timestamp,
            format!("{}-{}-{}", timestamp, self.origin.simple(), seq),
        )
    }
}

impl Default for EventMinter {
    fn default() -> Self {
        Self::new()
    }
}

/// A single mutation step inside a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Remove every entry with a timestamp strictly below the cutoff.
    EvictBefore(Timestamp),
    /// Add one entry.
    Insert(Event),
    /// Attach or refresh the whole-key expiry.
    SetExpiry(Duration),
}

/// An ordered list of mutation steps executed atomically against one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<StoreOp>,
}

impl Transaction {
    /// Create an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evict_before(mut self, cutoff: Timestamp) -> Self {
        self.ops.push(StoreOp::EvictBefore(cutoff));
        self
    }

    pub fn insert(mut self, event: Event) -> Self {
        self.ops.push(StoreOp::Insert(event));
        self
    }

    pub fn set_expiry(mut self, ttl: Duration) -> Self {
        self.ops.push(StoreOp::SetExpiry(ttl));
        self
    }

    /// The steps in execution order.
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// What a transaction changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOutcome {
    /// Entries removed by eviction steps
    pub evicted: u64,
    /// Entries actually added by insert steps (duplicates excluded)
    pub inserted: u64,
}

/// Per-key ordered event log shared by every process using the same backend.
///
/// Implementations must be safe for concurrent use. Failures to reach the
/// backend are reported as [`SlidelogError::StoreUnavailable`].
#[async_trait]
pub trait EventStore: Send + Sync + fmt::Debug {
    /// Remove all entries of `key` with a timestamp strictly less than `cutoff`.
    async fn evict_before(&self, key: &str, cutoff: Timestamp) -> Result<u64>;

    /// Add `event` to the log of `key`. Returns `false` if an entry with the
    /// same identity already existed.
    async fn insert(&self, key: &str, event: &Event) -> Result<bool>;

    /// Attach or refresh an expiry of `ttl` from now on the whole log of `key`.
    /// A key with no entries is left untouched.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Count entries of `key` with a timestamp in `[lo, hi]`.
    async fn count_range(&self, key: &str, lo: Timestamp, hi: Timestamp) -> Result<u64>;

    /// Run every step of `transaction` against `key` as one all-or-nothing unit.
    async fn run_atomically(&self, key: &str, transaction: &Transaction)
        -> Result<TransactionOutcome>;

    /// Whether [`EventStore::run_atomically_counting`] is available.
    fn supports_unified_count(&self) -> bool {
        false
    }

    /// Like [`EventStore::run_atomically`], with a `[lo, hi]` range count
    /// taken inside the same atomic unit after the steps ran.
    async fn run_atomically_counting(
        &self,
        _key: &str,
        _transaction: &Transaction,
        _lo: Timestamp,
        _hi: Timestamp,
    ) -> Result<(TransactionOutcome, u64)> {
        Err(SlidelogError::Config(
            "event store cannot count inside a transaction".to_string(),
        ))
    }

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()>;
}
