//! Sliding-window-log rate limiting.

mod backend;
mod limiter;
mod policy;
mod window;

pub use backend::Admission;
pub use limiter::{Decision, RateLimiter};
pub use policy::{FailurePolicy, FailurePolicyLimiter};
pub use window::{CountMode, WindowConfig};
