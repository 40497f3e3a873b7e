//! Admission trait for abstracting the limiter and its decorators.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

/// Trait for anything that decides whether a request may proceed.
///
/// Implemented by [`RateLimiter`](super::RateLimiter) and by
/// [`FailurePolicyLimiter`](super::FailurePolicyLimiter), so the HTTP layer
/// can work with either.
#[async_trait]
pub trait Admission: Send + Sync {
    /// Decide whether the next request for `identifier` may proceed.
    async fn allow(&self, identifier: &str) -> Result<bool>;
}

#[async_trait]
impl<A: Admission + ?Sized> Admission for Arc<A> {
    async fn allow(&self, identifier: &str) -> Result<bool> {
        (**self).allow(identifier).await
    }
}
