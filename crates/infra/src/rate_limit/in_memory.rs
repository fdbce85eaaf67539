use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{RateDecision, RateLimiter};

#[derive(Debug)]
struct Window {
    started: Instant,
    counts: HashMap<String, i64>,
}

/// Process-local limiter.
///
/// All clients share one window: once it is older than the window length the
/// whole map is cleared. Counts are not shared between processes.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    quota: i64,
    window_len: Duration,
    window: Mutex<Window>,
}

impl InMemoryRateLimiter {
    pub fn new(quota: i64, window: Duration) -> Self {
        Self {
            quota,
            window_len: window,
            window: Mutex::new(Window {
                started: Instant::now(),
                counts: HashMap::new(),
            }),
        }
    }

    /// One-minute windows.
    pub fn per_minute(quota: i64) -> Self {
        Self::new(quota, Duration::from_secs(60))
    }

    pub fn quota(&self) -> i64 {
        self.quota
    }

    /// Synchronous form of [`RateLimiter::allow`].
    pub fn check(&self, client_key: &str) -> RateDecision {
        if self.quota <= 0 {
            return RateDecision::unlimited();
        }

        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        if now.duration_since(window.started) > self.window_len {
            window.counts.clear();
            window.started = now;
        }

        let count = window.counts.entry(client_key.to_string()).or_insert(0);
        *count += 1;
        RateDecision::from_count(self.quota, *count)
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn allow(&self, client_key: &str) -> RateDecision {
        self.check(client_key)
    }
}
