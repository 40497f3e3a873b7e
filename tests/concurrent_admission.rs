//! Concurrent calls on one identifier.
//!
//! Unified counting serializes evict+record+expire+count, so admissions never
//! exceed the limit. Separate counting reads the count after the transaction;
//! inserts that land in between only cause extra denials, but an eviction by
//! a later call can hide events from an earlier call's count. The overshoot
//! is bounded by the events whose timestamps fall between the two calls'
//! cutoffs.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Barrier};

use slidelog::clock::{Clock, MockClock, Timestamp};
use slidelog::error::Result;
use slidelog::ratelimit::{CountMode, RateLimiter, WindowConfig};
use slidelog::store::{Event, EventStore, InMemoryEventStore, Transaction, TransactionOutcome};

/// Store that can hold one count read until the test releases it.
#[derive(Debug)]
struct PausingStore {
    inner: InMemoryEventStore,
    pause: Mutex<Option<Pause>>,
}

#[derive(Debug)]
struct Pause {
    reached: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

impl PausingStore {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: InMemoryEventStore::new(clock),
            pause: Mutex::new(None),
        }
    }

    /// Pause the next count read. Returns (reached, release) handles.
    fn arm(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        *self.pause.lock().unwrap() = Some(Pause {
            reached: reached_tx,
            release: release_rx,
        });
        (reached_rx, release_tx)
    }
}

#[async_trait]
impl EventStore for PausingStore {
    async fn evict_before(&self, key: &str, cutoff: Timestamp) -> Result<u64> {
        self.inner.evict_before(key, cutoff).await
    }

    async fn insert(&self, key: &str, event: &Event) -> Result<bool> {
        self.inner.insert(key, event).await
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        self.inner.set_expiry(key, ttl).await
    }

    async fn count_range(&self, key: &str, lo: Timestamp, hi: Timestamp) -> Result<u64> {
        let pause = self.pause.lock().unwrap().take();
        if let Some(pause) = pause {
            let _ = pause.reached.send(());
            let _ = pause.release.await;
        }
        self.inner.count_range(key, lo, hi).await
    }

    async fn run_atomically(
        &self,
        key: &str,
        transaction: &Transaction,
    ) -> Result<TransactionOutcome> {
        self.inner.run_atomically(key, transaction).await
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

fn window(secs: u64, limit: u64) -> WindowConfig {
    WindowConfig::new(Duration::from_secs(secs), limit).unwrap()
}

async fn simultaneous_admissions(mode: CountMode, calls: usize, limit: u64) -> usize {
    let clock: Arc<dyn Clock> = Arc::new(MockClock::from_unix_secs(1_700_000_000));
    let store = Arc::new(InMemoryEventStore::new(Arc::clone(&clock)));
    let limiter =
        Arc::new(RateLimiter::with_count_mode(window(60, limit), clock, store, mode).unwrap());
    let barrier = Arc::new(Barrier::new(calls));

    let handles = (0..calls).map(|_| {
        let limiter = Arc::clone(&limiter);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            limiter.allow("burst").await.unwrap()
        })
    });

    join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(|allowed| *allowed)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_unified_mode_admits_exactly_the_limit() {
    for _ in 0..10 {
        assert_eq!(simultaneous_admissions(CountMode::Unified, 20, 5).await, 5);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_separate_mode_never_exceeds_limit_at_one_instant() {
    for _ in 0..10 {
        let admitted = simultaneous_admissions(CountMode::Separate, 20, 5).await;
        assert!(admitted <= 5, "admitted {} of 20 with limit 5", admitted);
    }
}

/// Call A records at t=5s and stalls before its count read. Call B at
/// t=10s+1ns evicts the event from t=0. A then counts without it.
#[tokio::test]
async fn test_separate_mode_eviction_race_overshoots_by_one() {
    let clock = MockClock::from_unix_secs(1_700_000_000);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(PausingStore::new(Arc::clone(&shared)));
    let limiter = Arc::new(
        RateLimiter::with_count_mode(window(10, 1), shared, store.clone(), CountMode::Separate)
            .unwrap(),
    );

    assert!(limiter.allow("k").await.unwrap());

    clock.advance(Duration::from_secs(5));
    let (reached, release) = store.arm();
    let stalled = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.check("k").await.unwrap() })
    };
    reached.await.unwrap();

    clock.advance(Duration::from_secs(5) + Duration::from_nanos(1));
    let late = limiter.check("k").await.unwrap();
    assert!(!late.allowed);
    assert_eq!(late.count, 2);

    release.send(()).unwrap();
    let racy = stalled.await.unwrap();

    // Two events truly fall in A's window [t-5s, t+5s]. The one at t=0 lies
    // below B's cutoff, so A misses exactly that one and is admitted.
    assert!(racy.allowed);
    assert_eq!(racy.count, 1);
}

#[tokio::test]
async fn test_unified_mode_denies_the_same_sequence() {
    let clock = MockClock::from_unix_secs(1_700_000_000);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(InMemoryEventStore::new(Arc::clone(&shared)));
    let limiter =
        RateLimiter::with_count_mode(window(10, 1), shared, store, CountMode::Unified).unwrap();

    assert!(limiter.allow("k").await.unwrap());

    clock.advance(Duration::from_secs(5));
    let a = limiter.check("k").await.unwrap();
    assert!(!a.allowed);
    assert_eq!(a.count, 2);

    clock.advance(Duration::from_secs(5) + Duration::from_nanos(1));
    let b = limiter.check("k").await.unwrap();
    assert!(!b.allowed);
    assert_eq!(b.count, 2);
}
