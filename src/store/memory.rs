//! In-process event store.
//!
//! Each key's log lives behind a `dashmap` shard lock, so a transaction on one
//! key is atomic with respect to every other operation on that key. Expiry is
//! evaluated lazily against the injected clock, which makes this store usable
//! as a deterministic test double as well as a single-node backend.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Event, EventStore, StoreOp, Transaction, TransactionOutcome};
use crate::clock::{Clock, Timestamp};
use crate::error::Result;

#[derive(Debug, Default)]
struct KeyLog {
    /// Entries ordered by timestamp, then identity
    entries: BTreeSet<(Timestamp, String)>,
    /// Identity -> timestamp, for identity uniqueness
    index: HashMap<String, Timestamp>,
    expires_at: Option<Timestamp>,
}

impl KeyLog {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn evict_before(&mut self, cutoff: Timestamp) -> u64 {
        let kept = self.entries.split_off(&(cutoff, String::new()));
        let evicted = std::mem::replace(&mut self.entries, kept);
        for (_, id) in &evicted {
            self.index.remove(id);
        }
        evicted.len() as u64
    }

    /// Re-inserting a known identity moves it to the new timestamp and does
    /// not add an entry.
    fn insert(&mut self, event: &Event) -> bool {
        let id = event.id().to_string();
        match self.index.insert(id.clone(), event.timestamp()) {
            Some(previous) => {
                self.entries.remove(&(previous, id.clone()));
                self.entries.insert((event.timestamp(), id));
                false
            }
            None => self.entries.insert((event.timestamp(), id)),
        }
    }

    fn set_expiry(&mut self, now: Timestamp, ttl: Duration) {
        if !self.entries.is_empty() {
            self.expires_at = Some(now.saturating_add(ttl));
        }
    }

    fn count_range(&self, lo: Timestamp, hi: Timestamp) -> u64 {
        if lo > hi {
            return 0;
        }
        self.entries
            .range((lo, String::new())..)
            .take_while(|(ts, _)| *ts <= hi)
            .count() as u64
    }

    fn apply(&mut self, transaction: &Transaction, now: Timestamp) -> TransactionOutcome {
        let mut outcome = TransactionOutcome::default();
        for op in transaction.ops() {
            match op {
                StoreOp::EvictBefore(cutoff) => outcome.evicted += self.evict_before(*cutoff),
                StoreOp::Insert(event) => {
                    if self.insert(event) {
                        outcome.inserted += 1;
                    }
                }
                StoreOp::SetExpiry(ttl) => self.set_expiry(now, *ttl),
            }
        }
        outcome
    }
}

/// Event store held entirely in process memory.
pub struct InMemoryEventStore {
    logs: DashMap<String, KeyLog>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("keys", &self.logs.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl InMemoryEventStore {
    /// Create an empty store whose expiry follows `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            logs: DashMap::new(),
            clock,
        }
    }

    fn now(&self) -> Timestamp {
        self.clock.now().into()
    }

    /// Run `f` against the live log of `key` while holding its shard lock.
    fn with_log_mut<R>(&self, key: &str, f: impl FnOnce(&mut KeyLog, Timestamp) -> R) -> R {
        let now = self.now();
        let result = {
            let mut log = self.logs.entry(key.to_string()).or_default();
            if log.is_expired(now) {
                *log = KeyLog::default();
            }
            f(&mut *log, now)
        };
        // Empty logs do not exist, as with Redis sorted sets.
        self.logs.remove_if(key, |_, log| log.entries.is_empty());
        result
    }

    fn count(&self, key: &str, lo: Timestamp, hi: Timestamp) -> u64 {
        let now = self.now();
        self.logs
            .get(key)
            .filter(|log| !log.is_expired(now))
            .map_or(0, |log| log.count_range(lo, hi))
    }

    /// Whether `key` currently has a live, unexpired log.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.now();
        self.logs.get(key).is_some_and(|log| !log.is_expired(now))
    }

    /// Number of keys with a live log.
    pub fn len(&self) -> usize {
        let now = self.now();
        self.logs.iter().filter(|log| !log.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired log. Returns how many keys were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.now();
        let before = self.logs.len();
        self.logs.retain(|_, log| !log.is_expired(now));
        before.saturating_sub(self.logs.len())
    }

    /// Periodically purge expired logs until the returned handle is aborted.
    pub fn spawn_purger(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    debug!(purged = purged, "Purged expired event logs");
                }
            }
        })
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn evict_before(&self, key: &str, cutoff: Timestamp) -> Result<u64> {
        Ok(self.with_log_mut(key, |log, _| log.evict_before(cutoff)))
    }

    async fn insert(&self, key: &str, event: &Event) -> Result<bool> {
        Ok(self.with_log_mut(key, |log, _| log.insert(event)))
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_log_mut(key, |log, now| log.set_expiry(now, ttl));
        Ok(())
    }

    async fn count_range(&self, key: &str, lo: Timestamp, hi: Timestamp) -> Result<u64> {
        Ok(self.count(key, lo, hi))
    }

    async fn run_atomically(
        &self,
        key: &str,
        transaction: &Transaction,
    ) -> Result<TransactionOutcome> {
        Ok(self.with_log_mut(key, |log, now| log.apply(transaction, now)))
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
        Ok(self.with_log_mut(key, |log, now| {
            let outcome = log.apply(transaction, now);
            (outcome, log.count_range(lo, hi))
        }))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn ts(nanos: i64) -> Timestamp {
        Timestamp::from_unix_nanos(nanos)
    }

    fn store_at(secs: i64) -> (InMemoryEventStore, MockClock) {
        let clock = MockClock::from_unix_secs(secs);
        (InMemoryEventStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_evict_before_is_strict() {
        let (store, _) = store_at(0);
        store.insert("k", &Event::new(ts(10), "a")).await.unwrap();
        store.insert("k", &Event::new(ts(20), "b")).await.unwrap();
        store.insert("k", &Event::new(ts(30), "c")).await.unwrap();

        assert_eq!(store.evict_before("k", ts(20)).await.unwrap(), 1);
        assert_eq!(store.count_range("k", ts(0), ts(100)).await.unwrap(), 2);

        // Nothing left below the cutoff.
        assert_eq!(store.evict_before("k", ts(20)).await.unwrap(), 0);
        assert_eq!(store.evict_before("missing", ts(20)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_is_unique_by_identity() {
        let (store, _) = store_at(0);

        assert!(store.insert("k", &Event::new(ts(10), "a")).await.unwrap());
        assert!(!store.insert("k", &Event::new(ts(10), "a")).await.unwrap());
        // Same timestamp, different identity: a separate entry.
        assert!(store.insert("k", &Event::new(ts(10), "b")).await.unwrap());
        assert_eq!(store.count_range("k", ts(10), ts(10)).await.unwrap(), 2);

        // Known identity at a new timestamp moves rather than adds.
        assert!(!store.insert("k", &Event::new(ts(50), "a")).await.unwrap());
        assert_eq!(store.count_range("k", ts(0), ts(20)).await.unwrap(), 1);
        assert_eq!(store.count_range("k", ts(0), ts(100)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_count_range_bounds_are_inclusive() {
        let (store, _) = store_at(0);
        for (n, id) in [(5, "a"), (10, "b"), (15, "c"), (20, "d")] {
            store.insert("k", &Event::new(ts(n), id)).await.unwrap();
        }

        assert_eq!(store.count_range("k", ts(10), ts(15)).await.unwrap(), 2);
        assert_eq!(store.count_range("k", ts(11), ts(14)).await.unwrap(), 0);
        assert_eq!(store.count_range("k", ts(20), ts(5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_log_is_forgotten() {
        let (store, clock) = store_at(1_000);
        store.insert("k", &Event::new(ts(1), "a")).await.unwrap();
        store.set_expiry("k", Duration::from_secs(60)).await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(store.contains_key("k"));

        clock.advance(Duration::from_secs(1));
        assert!(!store.contains_key("k"));
        assert_eq!(store.count_range("k", ts(0), ts(i64::MAX)).await.unwrap(), 0);
        assert_eq!(store.len(), 0);
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_set_expiry_on_missing_key_creates_nothing() {
        let (store, _) = store_at(0);
        store.set_expiry("ghost", Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_run_atomically_reports_outcome() {
        let (store, _) = store_at(0);
        store.insert("k", &Event::new(ts(1), "old")).await.unwrap();

        let tx = Transaction::new()
            .evict_before(ts(5))
            .insert(Event::new(ts(10), "new"))
            .set_expiry(Duration::from_secs(1));
        let outcome = store.run_atomically("k", &tx).await.unwrap();

        assert_eq!(
            outcome,
            TransactionOutcome {
                evicted: 1,
                inserted: 1
            }
        );
        assert!(store.supports_unified_count());

        let tx = Transaction::new().insert(Event::new(ts(11), "newer"));
        let (outcome, count) = store
            .run_atomically_counting("k", &tx, ts(0), ts(11))
            .await
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_are_all_recorded() {
        let clock = MockClock::from_unix_secs(0);
        let store = Arc::new(InMemoryEventStore::new(Arc::new(clock)));

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let tx = Transaction::new().insert(Event::new(ts(1), format!("e{}", i)));
                    store.run_atomically("k", &tx).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.count_range("k", ts(1), ts(1)).await.unwrap(), 64);
    }
}
