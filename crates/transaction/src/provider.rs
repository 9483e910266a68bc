use std::time::Duration;

use redis::AsyncConnectionConfig;
use redis::aio::MultiplexedConnection;

use crate::Result;
use crate::scope::TransactionScope;

/// Connection settings for Redis.
///
/// Reads from environment variables:
/// - `REDIS_URL` — connection URL (default: `"redis://127.0.0.1:6379"`)
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
}

impl RedisSettings {
    /// Creates settings for the given connection URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Loads settings from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| Self::default().url),
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Hands out the shared Redis connection and the scopes built on it.
///
/// This is the only place where transactional scopes are created.
#[derive(Clone)]
pub struct RedisProvider {
    client: redis::Client,
    connection: MultiplexedConnection,
}

impl RedisProvider {
    /// Opens the shared multiplexed connection.
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let client = redis::Client::open(settings.url.as_str())?;
        let connection = client.get_multiplexed_async_connection().await?;
        tracing::info!(url = %settings.url, "connected to redis");
        Ok(Self { client, connection })
    }

    /// Returns a handle to the shared connection for reads and for commands
    /// that never take part in a transaction.
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    /// Opens a connection that is not shared with any other caller.
    ///
    /// Used for blocking stream reads so that they never stall ordinary
    /// traffic. `response_timeout` must exceed the longest blocking call.
    pub async fn dedicated_connection(
        &self,
        response_timeout: Duration,
    ) -> Result<MultiplexedConnection> {
        let config = AsyncConnectionConfig::new().set_response_timeout(response_timeout);
        let connection = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        Ok(connection)
    }

    /// Creates a scope backed by a new `MULTI`/`EXEC` transaction.
    pub fn with_transaction(&self) -> TransactionScope {
        TransactionScope::transactional(self.client.clone(), self.connection())
    }

    /// Creates a scope that runs every operation immediately.
    pub fn without_transaction(&self) -> TransactionScope {
        TransactionScope::immediate(self.connection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_point_at_localhost() {
        assert_eq!(RedisSettings::default().url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn settings_keep_given_url() {
        let settings = RedisSettings::new("redis://cache:6380/2");
        assert_eq!(settings.url, "redis://cache:6380/2");
    }
}
