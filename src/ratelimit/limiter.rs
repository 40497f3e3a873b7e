//! Sliding-window-log rate limiter.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::Admission;
use super::window::{CountMode, WindowConfig};
use crate::clock::{Clock, Timestamp};
use crate::error::{Result, SlidelogError};
use crate::store::{EventMinter, EventStore, Transaction};

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Events in the window after recording this one
    pub count: u64,
    /// The configured limit
    pub limit: u64,
}

impl Decision {
    /// Requests left in the current window.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

/// The sliding-window-log rate limiter.
///
/// Holds no per-identifier state: every event lives in the shared
/// [`EventStore`], so any number of limiter instances across processes can
/// serve the same identifiers. Thread-safe and meant to be shared via `Arc`.
///
/// Every call records an event, denied calls included, so an identifier
/// stays limited until enough of its events age out of the window.
pub struct RateLimiter {
    config: WindowConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn EventStore>,
    mode: CountMode,
    minter: EventMinter,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("mode", &self.mode)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter, counting inside the transaction when the store can.
    pub fn new(config: WindowConfig, clock: Arc<dyn Clock>, store: Arc<dyn EventStore>) -> Self {
        let mode = if store.supports_unified_count() {
            CountMode::Unified
        } else {
            CountMode::Separate
        };
        Self {
            config,
            clock,
            store,
            mode,
            minter: EventMinter::new(),
        }
    }

    /// Create a limiter with an explicit count mode.
    ///
    /// Fails if `mode` is [`CountMode::Unified`] and the store cannot count
    /// inside a transaction.
    pub fn with_count_mode(
        config: WindowConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn EventStore>,
        mode: CountMode,
    ) -> Result<Self> {
        if mode == CountMode::Unified && !store.supports_unified_count() {
            return Err(SlidelogError::Config(format!(
                "{:?} cannot count inside a transaction; use the separate count mode",
                store
            )));
        }
        Ok(Self {
            config,
            clock,
            store,
            mode,
            minter: EventMinter::new(),
        })
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn count_mode(&self) -> CountMode {
        self.mode
    }

    /// Decide whether the next request for `identifier` may proceed.
    ///
    /// A store failure is returned as an error and never as a decision.
    pub async fn allow(&self, identifier: &str) -> Result<bool> {
        Ok(self.check(identifier).await?.allowed)
    }

    /// Record a request for `identifier` and return the full decision.
    pub async fn check(&self, identifier: &str) -> Result<Decision> {
        if identifier.is_empty() {
            return Err(SlidelogError::InvalidIdentifier);
        }

        let now = Timestamp::from(self.clock.now());
        let cutoff = now.saturating_sub(self.config.window());
        let transaction = Transaction::new()
            .evict_before(cutoff)
            .insert(self.minter.mint(now))
            .set_expiry(self.config.window());

        trace!(key = %identifier, now = %now, mode = ?self.mode, "Checking rate limit");

        let count = match self.mode {
            CountMode::Unified => {
                let (_, count) = self
                    .store
                    .run_atomically_counting(identifier, &transaction, cutoff, now)
                    .await?;
                count
            }
            CountMode::Separate => {
                self.store.run_atomically(identifier, &transaction).await?;
                self.store.count_range(identifier, cutoff, now).await?
            }
        };

        let limit = self.config.limit();
        let allowed = count <= limit;
        if !allowed {
            debug!(key = %identifier, count = count, limit = limit, "Rate limit exceeded");
        }

        Ok(Decision {
            allowed,
            count,
            limit,
        })
    }
}

#[async_trait]
impl Admission for RateLimiter {
    async fn allow(&self, identifier: &str) -> Result<bool> {
        RateLimiter::allow(self, identifier).await
    }
}
