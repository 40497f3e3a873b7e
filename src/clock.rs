//! Clock adapters and the nanosecond timestamps the event log is sorted by.
//!
//! `SystemClock` reads wall-clock time, which is what every process sharing
//! an event store must agree on. `MockClock` lets tests move time explicitly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Source of the current instant.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Get the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Nanoseconds since the Unix epoch.
///
/// Used both as the sort key of an event and as the bound of range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Create a timestamp from nanoseconds since the Unix epoch.
    pub const fn from_unix_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Nanoseconds since the Unix epoch.
    pub const fn as_unix_nanos(&self) -> i64 {
        self.0
    }

    /// Microseconds since the Unix epoch, rounded towards negative infinity.
    pub fn as_unix_micros(&self) -> i64 {
        self.0.div_euclid(1_000)
    }

    /// The instant `duration` before this one.
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(nanos))
    }

    /// The instant `duration` after this one.
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let nanos = i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(nanos))
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(time: DateTime<Utc>) -> Self {
        // Only representable between 1677 and 2262; saturate outside that range.
        let nanos = time.timestamp_nanos_opt().unwrap_or(if time.timestamp() < 0 {
            i64::MIN
        } else {
            i64::MAX
        });
        Self(nanos)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Controllable clock for tests.
///
/// Clones share the same underlying time, so advancing one clone advances
/// all of them.
///
/// ```
/// use slidelog::clock::{Clock, MockClock};
/// use std::time::Duration;
///
/// let clock = MockClock::from_unix_secs(1_700_000_000);
/// let start = clock.now();
/// clock.advance(Duration::from_secs(61));
/// assert_eq!((clock.now() - start).num_seconds(), 61);
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a mock clock starting at a specific time.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a mock clock starting at whole seconds since the Unix epoch.
    pub fn from_unix_secs(secs: i64) -> Self {
        Self::new(DateTime::from_timestamp(secs, 0).unwrap_or_default())
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        let delta = chrono::Duration::from_std(duration)
            .expect("MockClock cannot advance by more than chrono::Duration::MAX");
        let mut time = self.current_time.lock();
        *time += delta;
    }

    /// Set the clock to a specific time.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.current_time.lock() = time;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock()
    }
}
