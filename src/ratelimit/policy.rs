//! Fail-open / fail-closed handling of store failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::backend::Admission;
use crate::error::Result;

/// What to do when the limiter cannot reach its event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Return the error to the caller.
    Propagate,
    /// Let the request through.
    FailOpen,
    /// Reject the request.
    #[default]
    FailClosed,
}

/// Wraps an [`Admission`] and applies a [`FailurePolicy`] to store errors.
///
/// Only `StoreUnavailable` errors are subject to the policy; anything else
/// (such as an empty identifier) is always returned.
#[derive(Debug)]
pub struct FailurePolicyLimiter<A> {
    inner: A,
    policy: FailurePolicy,
}

impl<A: Admission> FailurePolicyLimiter<A> {
    pub fn new(inner: A, policy: FailurePolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: Admission> Admission for FailurePolicyLimiter<A> {
    async fn allow(&self, identifier: &str) -> Result<bool> {
        match self.inner.allow(identifier).await {
            Err(err) if err.is_store_unavailable() => match self.policy {
                FailurePolicy::Propagate => Err(err),
                FailurePolicy::FailOpen => {
                    warn!(key = %identifier, error = %err, "Event store unavailable, failing open");
                    Ok(true)
                }
                FailurePolicy::FailClosed => {
                    warn!(key = %identifier, error = %err, "Event store unavailable, failing closed");
                    Ok(false)
                }
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SlidelogError;

    struct Broken;

    #[async_trait]
    impl Admission for Broken {
        async fn allow(&self, identifier: &str) -> Result<bool> {
            if identifier.is_empty() {
                return Err(SlidelogError::InvalidIdentifier);
            }
            Err(SlidelogError::StoreUnavailable("connection refused".to_string()))
        }
    }

    struct Fixed(bool);

    #[async_trait]
    impl Admission for Fixed {
        async fn allow(&self, _identifier: &str) -> Result<bool> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_fail_open_allows() {
        let limiter = FailurePolicyLimiter::new(Broken, FailurePolicy::FailOpen);
        assert!(limiter.allow("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_closed_denies() {
        let limiter = FailurePolicyLimiter::new(Broken, FailurePolicy::FailClosed);
        assert!(!limiter.allow("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_propagate_returns_error() {
        let limiter = FailurePolicyLimiter::new(Broken, FailurePolicy::Propagate);
        let err = limiter.allow("a").await.unwrap_err();
        assert!(err.is_store_unavailable());
    }

    #[tokio::test]
    async fn test_caller_errors_bypass_policy() {
        let limiter = FailurePolicyLimiter::new(Broken, FailurePolicy::FailOpen);
        let err = limiter.allow("").await.unwrap_err();
        assert!(matches!(err, SlidelogError::InvalidIdentifier));
    }

    #[tokio::test]
    async fn test_decisions_pass_through() {
        let open = FailurePolicyLimiter::new(Fixed(false), FailurePolicy::FailOpen);
        assert!(!open.allow("a").await.unwrap());

        let closed = FailurePolicyLimiter::new(Fixed(true), FailurePolicy::FailClosed);
        assert!(closed.allow("a").await.unwrap());
    }
}
