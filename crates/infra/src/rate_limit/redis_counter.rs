use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;

use crate::connection::RedisConnection;

use super::{CounterError, WindowCounter};

/// Extra lifetime on a window key past the end of its window.
const EXPIRY_SLACK: Duration = Duration::from_secs(5);

/// Increment, and set the expiry only on the first hit of a window.
/// One round trip, so a deadline can never leave a key without a TTL.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Window counters in Redis: `INCR ratelimit:<client>:<bucket>`, where the
/// bucket is the number of whole windows since the Unix epoch.
#[derive(Clone)]
pub struct RedisWindowCounter {
    conn: ConnectionManager,
    prefix: String,
    script: redis::Script,
}

impl std::fmt::Debug for RedisWindowCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWindowCounter")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisWindowCounter {
    pub fn new(connection: &RedisConnection) -> Self {
        Self {
            conn: connection.manager(),
            prefix: "ratelimit".to_string(),
            script: redis::Script::new(INCREMENT_SCRIPT),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

fn expiry_secs(window: Duration) -> u64 {
    (window + EXPIRY_SLACK).as_secs().max(1)
}

fn window_key(prefix: &str, client_key: &str, unix_secs: i64, window: Duration) -> String {
    let window_secs = window.as_secs().max(1) as i64;
    format!("{prefix}:{client_key}:{}", unix_secs.div_euclid(window_secs))
}

#[async_trait]
impl WindowCounter for RedisWindowCounter {
    async fn increment(&self, client_key: &str, window: Duration) -> Result<i64, CounterError> {
        let mut conn = self.conn.clone();
        let key = window_key(&self.prefix, client_key, Utc::now().timestamp(), window);

        self.script
            .key(&key)
            .arg(expiry_secs(window))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CounterError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_bucket_by_window() {
        let minute = Duration::from_secs(60);
        assert_eq!(window_key("ratelimit", "10.0.0.1", 120, minute), "ratelimit:10.0.0.1:2");
        assert_eq!(window_key("ratelimit", "10.0.0.1", 179, minute), "ratelimit:10.0.0.1:2");
        assert_eq!(window_key("ratelimit", "10.0.0.1", 180, minute), "ratelimit:10.0.0.1:3");
    }

    #[test]
    fn keys_outlive_their_window_by_the_slack() {
        assert_eq!(expiry_secs(Duration::from_secs(60)), 65);
        assert_eq!(expiry_secs(Duration::from_millis(10)), 5);
    }

    #[test]
    fn sub_second_windows_use_one_second_buckets() {
        let key = window_key("rl", "a", 42, Duration::from_millis(10));
        assert_eq!(key, "rl:a:42");
    }
}
