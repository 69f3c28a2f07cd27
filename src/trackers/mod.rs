//! Health-tracking collaborators consumed by the cascade loop.
//!
//! Each tracker is a narrow trait plus an in-memory default. The router
//! only ever calls trait methods; each implementation owns its own
//! concurrency discipline and eviction policy.

pub mod circuit;
pub mod dedupe;
pub mod perf;
pub mod rate_limit;
pub mod timeout;

pub use circuit::{CircuitBreaker, FailureWindowBreaker};
pub use dedupe::{CachedCompletion, DedupeCache, InMemoryDedupe};
pub use perf::{InMemoryPerfTracker, ModelPerfSnapshot, ModelPerfTracker};
pub use rate_limit::{RateLimitTracker, WarningStatus, WindowRateLimiter};
pub use timeout::{AdaptiveTimeoutTracker, KeyTimeoutTracker, TimeoutClass};
