//! Sliding window configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SlidelogError};

/// Immutable (window, limit) pair a limiter is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    window: Duration,
    limit: u64,
}

impl WindowConfig {
    /// Create a window configuration.
    ///
    /// `window` must be positive. A `limit` of 0 denies every request.
    pub fn new(window: Duration, limit: u64) -> Result<Self> {
        if window.is_zero() {
            return Err(SlidelogError::Config(
                "window duration must be greater than zero".to_string(),
            ));
        }
        Ok(Self { window, limit })
    }

    /// Trailing duration over which requests are counted.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum requests allowed within one window, the current one included.
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// Whether the range count runs inside the mutation's atomic unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountMode {
    /// Evict, record, expire and count in one atomic unit.
    #[default]
    Unified,
    /// Count with a separate read after the transaction. Concurrent calls on
    /// the same identifier may interleave between the two.
    Separate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_window_is_rejected() {
        let err = WindowConfig::new(Duration::ZERO, 10).unwrap_err();
        assert!(matches!(err, SlidelogError::Config(_)));
    }

    #[test]
    fn test_zero_limit_is_accepted() {
        let config = WindowConfig::new(Duration::from_secs(1), 0).unwrap();
        assert_eq!(config.limit(), 0);
        assert_eq!(config.window(), Duration::from_secs(1));
    }

    #[test]
    fn test_count_mode_names() {
        let mode: CountMode = serde_yaml::from_str("separate").unwrap();
        assert_eq!(mode, CountMode::Separate);
        assert_eq!(CountMode::default(), CountMode::Unified);
    }
}
