use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Error, Debug)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Timeout error")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[error("Redis error: {0}")]
    Other(#[from] redis::RedisError),
}

/// A very small redis wrapper, covering what the read-through caches need.
#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn set(&self, k: String, v: String, ttl: Duration) -> Result<(), CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
}

pub type RedisClientHandle = Arc<dyn Client + Send + Sync>;

pub struct RedisClient {
    client: redis::Client,
    timeout: Duration,
}

impl RedisClient {
    pub fn new(addr: String, timeout: Duration) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient { client, timeout })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let result: Option<String> = timeout(self.timeout, conn.get(k)).await??;
        result.ok_or(CustomRedisError::NotFound)
    }

    async fn set(&self, k: String, v: String, ttl: Duration) -> Result<(), CustomRedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let seconds = ttl.as_secs().max(1);
        timeout(self.timeout, conn.set_ex::<_, _, ()>(k, v, seconds as usize)).await??;
        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        timeout(self.timeout, conn.del::<_, ()>(k)).await??;
        Ok(())
    }
}

/// In-process stand-in for redis, used by tests and local runs without a redis.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    values: Arc<Mutex<HashMap<String, String>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl MockRedisClient {
    pub fn new() -> MockRedisClient {
        MockRedisClient::default()
    }

    pub fn with_value(self, k: &str, v: &str) -> Self {
        self.lock_values().insert(k.to_string(), v.to_string());
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self
            .unavailable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = unavailable;
    }

    pub fn stored(&self, k: &str) -> Option<String> {
        self.lock_values().get(k).cloned()
    }

    fn lock_values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), CustomRedisError> {
        if *self
            .unavailable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            return Err(CustomRedisError::Other(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "mock redis unavailable",
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        self.check_available()?;
        self.lock_values()
            .get(&k)
            .cloned()
            .ok_or(CustomRedisError::NotFound)
    }

    async fn set(&self, k: String, v: String, _ttl: Duration) -> Result<(), CustomRedisError> {
        self.check_available()?;
        self.lock_values().insert(k, v);
        Ok(())
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        self.check_available()?;
        self.lock_values().remove(&k);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_round_trip() {
        let client = MockRedisClient::new();
        client
            .set("k".to_string(), "v".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(client.get("k".to_string()).await.unwrap(), "v");

        client.del("k".to_string()).await.unwrap();
        assert!(matches!(
            client.get("k".to_string()).await,
            Err(CustomRedisError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let client = MockRedisClient::new().with_value("k", "v");
        client.set_unavailable(true);
        assert!(matches!(
            client.get("k".to_string()).await,
            Err(CustomRedisError::Other(_))
        ));
    }
}
