//! Redis connection setup shared by the durable backends.

use std::future::Future;
use std::time::Duration;

use redis::IntoConnectionInfo;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::config::RedisSettings;

/// Upper bound for establishing the initial connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound for the startup `PING`.
pub const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid redis address: {0}")]
    InvalidAddress(String),
    #[error("redis unreachable: {0}")]
    Unreachable(String),
    #[error("redis did not answer within {0:?}")]
    Timeout(Duration),
}

/// A verified Redis connection.
///
/// Holds the client (for dedicated connections such as blocking stream
/// reads) and a shared auto-reconnecting [`ConnectionManager`] for
/// everything else. Cloning is cheap.
#[derive(Clone)]
pub struct RedisConnection {
    client: redis::Client,
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("addr", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisConnection {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, ConnectError> {
        let client = redis::Client::open(connection_info(settings)?)
            .map_err(|e| ConnectError::InvalidAddress(e.to_string()))?;

        let manager = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| ConnectError::Timeout(CONNECT_TIMEOUT))?
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        let connection = Self { client, manager };
        connection.ping().await?;

        info!(addr = %settings.addr, db = settings.db, "connected to redis");
        Ok(connection)
    }

    pub async fn ping(&self) -> Result<(), ConnectError> {
        let mut conn = self.manager();
        let pong: String = tokio::time::timeout(
            PING_TIMEOUT,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| ConnectError::Timeout(PING_TIMEOUT))?
        .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        if pong != "PONG" {
            return Err(ConnectError::Unreachable(format!("unexpected PING reply: {pong}")));
        }
        Ok(())
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    /// A handle on the shared multiplexed connection.
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn connection_info(settings: &RedisSettings) -> Result<redis::ConnectionInfo, ConnectError> {
    let url = if settings.addr.starts_with("redis://") || settings.addr.starts_with("rediss://") {
        settings.addr.clone()
    } else {
        format!("redis://{}/{}", settings.addr, settings.db)
    };

    let mut info = url
        .into_connection_info()
        .map_err(|e| ConnectError::InvalidAddress(e.to_string()))?;
    if let Some(password) = &settings.password {
        info.redis.password = Some(password.clone());
    }
    Ok(info)
}

/// Run one Redis round trip under a deadline.
///
/// Both a Redis error and an expired deadline come back as a message; callers
/// wrap it in their own "backend unavailable" variant.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, String>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {limit:?}")),
    }
}
