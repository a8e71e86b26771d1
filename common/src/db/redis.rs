// Redis connection for multi-node enrollment locking

use crate::config::RedisConfig;
use crate::errors::StorageError;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, instrument};

/// Auto-reconnecting Redis connection shared by lock holders
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
}

impl RedisPool {
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StorageError::ConnectionFailed(format!("Invalid Redis URL: {}", e)))?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to connect to Redis: {}", e))
        })?;

        info!("Redis connection ready");
        Ok(Self { manager })
    }

    /// Cheap clone of the managed connection
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::RedisError(format!("PING failed: {}", e)))?;

        match reply.as_str() {
            "PONG" => Ok(()),
            other => Err(StorageError::RedisError(format!(
                "Unexpected PING reply: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_ping() {
        let pool = RedisPool::new(&RedisConfig {
            url: "redis://localhost:6379".to_string(),
        })
        .await
        .unwrap();
        assert!(pool.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_url_rejected() {
        let result = RedisPool::new(&RedisConfig {
            url: "not-a-redis-url".to_string(),
        })
        .await;
        assert!(matches!(result, Err(StorageError::ConnectionFailed(_))));
    }
}
