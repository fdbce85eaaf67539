//! Per-client fixed-window submission limiting.
//!
//! A client gets `quota` submissions per window (one minute by default).
//! Counting is approximate at window edges: a burst straddling a boundary can
//! see up to twice the quota. Limiting is best effort; an unavailable counter
//! backend never turns into a denial.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod durable;
pub mod in_memory;
pub mod redis_counter;

pub use durable::{DurableRateLimiter, FALLBACK_TIMEOUT};
pub use in_memory::InMemoryRateLimiter;
pub use redis_counter::RedisWindowCounter;

/// Outcome of one `allow` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Submissions left in the current window, never negative. `None` when
    /// limiting is disabled.
    pub remaining: Option<u64>,
}

impl RateDecision {
    /// Decision when limiting is disabled.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: None,
        }
    }

    /// Decision for the `count`-th request of a window with the given quota.
    pub fn from_count(quota: i64, count: i64) -> Self {
        if quota <= 0 {
            return Self::unlimited();
        }
        Self {
            allowed: count <= quota,
            remaining: Some(quota.saturating_sub(count).max(0) as u64),
        }
    }
}

/// Gate in front of job submission.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request for `client_key` and decide whether it may proceed.
    async fn allow(&self, client_key: &str) -> RateDecision;
}

#[async_trait]
impl<L> RateLimiter for Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn allow(&self, client_key: &str) -> RateDecision {
        (**self).allow(client_key).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate counter unavailable: {0}")]
pub struct CounterError(pub String);

/// Shared counter backend for [`DurableRateLimiter`].
#[async_trait]
pub trait WindowCounter: Send + Sync {
    /// Increment the counter for `client_key` in the current window of length
    /// `window` and return the new count.
    async fn increment(&self, client_key: &str, window: Duration) -> Result<i64, CounterError>;
}
