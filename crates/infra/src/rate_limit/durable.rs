use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{InMemoryRateLimiter, RateDecision, RateLimiter, WindowCounter};

/// Deadline for one counter round trip before falling back.
pub const FALLBACK_TIMEOUT: Duration = Duration::from_millis(200);

/// Limiter counting through a shared [`WindowCounter`].
///
/// When the counter errors or is slower than the deadline, that request is
/// counted by an embedded [`InMemoryRateLimiter`] instead.
#[derive(Debug)]
pub struct DurableRateLimiter<C> {
    counter: C,
    quota: i64,
    window: Duration,
    timeout: Duration,
    fallback: InMemoryRateLimiter,
}

impl<C: WindowCounter> DurableRateLimiter<C> {
    pub fn new(counter: C, quota: i64, window: Duration) -> Self {
        Self {
            counter,
            quota,
            window,
            timeout: FALLBACK_TIMEOUT,
            fallback: InMemoryRateLimiter::new(quota, window),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl<C: WindowCounter> RateLimiter for DurableRateLimiter<C> {
    async fn allow(&self, client_key: &str) -> RateDecision {
        if self.quota <= 0 {
            return RateDecision::unlimited();
        }

        match tokio::time::timeout(self.timeout, self.counter.increment(client_key, self.window)).await {
            Ok(Ok(count)) => RateDecision::from_count(self.quota, count),
            Ok(Err(e)) => {
                warn!(client = client_key, error = %e, "rate counter failed, counting locally");
                self.fallback.check(client_key)
            }
            Err(_) => {
                warn!(client = client_key, timeout = ?self.timeout, "rate counter timed out, counting locally");
                self.fallback.check(client_key)
            }
        }
    }
}
