//! Process configuration loaded from the environment.
//!
//! Every setting has a default, so an empty environment yields a working
//! single-process (volatile) setup. Invalid numeric values fall back to the
//! default with a log line rather than failing startup.

use std::time::Duration;

use tracing::{info, warn};

use crate::jobs::MAX_CONCURRENCY;

pub const DEFAULT_MAX_WORKERS: usize = 3;
pub const DEFAULT_QUEUE_BUFFER_SIZE: usize = 100;
pub const DEFAULT_QUEUE_NAME: &str = "jobs";
pub const DEFAULT_RATE_LIMIT_RPM: i64 = 300;
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Where job records, messages and rate-limit counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Process-local maps and channels.
    Volatile,
    /// Redis.
    Durable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    /// `host:port`, or a full `redis://` URL.
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Capacity of the volatile bus.
    pub buffer_size: usize,
    /// Stream key of the durable bus.
    pub name: String,
    /// Approximate cap on the durable stream; 0 keeps everything.
    pub max_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Submissions per client per window; 0 or less disables limiting.
    pub quota: i64,
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutorSettings {
    pub program: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub max_workers: usize,
    pub redis: Option<RedisSettings>,
    pub queue: QueueSettings,
    pub rate_limit: RateLimitSettings,
    pub executor: ExecutorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            redis: None,
            queue: QueueSettings {
                buffer_size: DEFAULT_QUEUE_BUFFER_SIZE,
                name: DEFAULT_QUEUE_NAME.to_string(),
                max_length: 0,
            },
            rate_limit: RateLimitSettings {
                quota: DEFAULT_RATE_LIMIT_RPM,
                window: DEFAULT_RATE_LIMIT_WINDOW,
            },
            executor: ExecutorSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup (tests, layered sources).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let max_workers = match get("MAX_WORKERS").map(|v| v.parse::<usize>()) {
            Some(Ok(n)) if (1..=MAX_CONCURRENCY).contains(&n) => n,
            _ => {
                info!(default = DEFAULT_MAX_WORKERS, "MAX_WORKERS not set or invalid, using default");
                DEFAULT_MAX_WORKERS
            }
        };

        let buffer_size = parse_or("QUEUE_BUFFER_SIZE", get("QUEUE_BUFFER_SIZE"), |n: &usize| *n > 0)
            .unwrap_or(defaults.queue.buffer_size);

        let redis = get("REDIS_ADDR").map(|addr| RedisSettings {
            addr,
            password: get("REDIS_PASSWORD"),
            db: parse_or("REDIS_DB", get("REDIS_DB"), |n: &i64| *n >= 0).unwrap_or(0),
        });

        let queue = QueueSettings {
            buffer_size,
            name: get("QUEUE_NAME").unwrap_or(defaults.queue.name),
            max_length: parse_or("QUEUE_MAX_LENGTH", get("QUEUE_MAX_LENGTH"), |_: &usize| true)
                .unwrap_or(0),
        };

        let rate_limit = RateLimitSettings {
            quota: parse_or("RATE_LIMIT_RPM", get("RATE_LIMIT_RPM"), |n: &i64| *n > 0)
                .unwrap_or(DEFAULT_RATE_LIMIT_RPM),
            window: DEFAULT_RATE_LIMIT_WINDOW,
        };

        let executor = ExecutorSettings {
            program: get("EXECUTOR_PATH"),
            args: get("EXECUTOR_ARGS")
                .map(|csv| split_and_clean(&csv))
                .unwrap_or_default(),
        };

        Self {
            max_workers,
            redis,
            queue,
            rate_limit,
            executor,
        }
    }

    pub fn backend(&self) -> BackendKind {
        if self.redis.is_some() {
            BackendKind::Durable
        } else {
            BackendKind::Volatile
        }
    }
}

fn parse_or<T, P>(key: &str, raw: Option<String>, valid: P) -> Option<T>
where
    T: std::str::FromStr,
    P: Fn(&T) -> bool,
{
    let raw = raw?;
    match raw.parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        _ => {
            warn!(key, value = %raw, "ignoring invalid setting");
            None
        }
    }
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
fn split_and_clean(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
