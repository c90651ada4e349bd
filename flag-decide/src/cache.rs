use std::future::Future;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::database::StoreError;
use crate::metrics::utils::inc;
use crate::redis::{CustomRedisError, RedisClientHandle};

/// Counter names a cache reports under.
#[derive(Debug, Clone, Copy)]
pub struct CacheMetrics {
    pub hits: &'static str,
    pub errors: &'static str,
    pub db_reads: &'static str,
}

/// Redis-backed read-through cache of JSON values.
///
/// Redis is never a source of truth here: any redis failure falls through to the
/// loader, and a value the loader returns is written back with the configured TTL.
#[derive(Clone)]
pub struct ReadThroughCache {
    redis: RedisClientHandle,
    prefix: &'static str,
    ttl: Duration,
    metrics: CacheMetrics,
}

impl ReadThroughCache {
    pub fn new(
        redis: RedisClientHandle,
        prefix: &'static str,
        ttl: Duration,
        metrics: CacheMetrics,
    ) -> Self {
        Self {
            redis,
            prefix,
            ttl,
            metrics,
        }
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn record_error(&self, operation: &str, err: &CustomRedisError) {
        let reason = match err {
            CustomRedisError::NotFound => "not_found",
            CustomRedisError::Timeout(_) => "timeout",
            CustomRedisError::Other(_) => "redis_error",
        };
        inc(
            self.metrics.errors,
            &[
                ("operation".to_string(), operation.to_string()),
                ("reason".to_string(), reason.to_string()),
            ],
            1,
        );
    }

    async fn read<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        match self.redis.get(self.cache_key(key)).await {
            Ok(serialized) => match serde_json::from_str(&serialized) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key, "discarding unparseable cache entry: {}", e);
                    inc(
                        self.metrics.errors,
                        &[
                            ("operation".to_string(), "read".to_string()),
                            ("reason".to_string(), "parse_error".to_string()),
                        ],
                        1,
                    );
                    None
                }
            },
            Err(CustomRedisError::NotFound) => None,
            Err(e) => {
                tracing::warn!(key, "redis read failed, falling back to postgres: {}", e);
                self.record_error("read", &e);
                None
            }
        }
    }

    async fn write<V: Serialize>(&self, key: &str, value: &V) {
        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(key, "failed to serialize cache entry: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .redis
            .set(self.cache_key(key), serialized, self.ttl)
            .await
        {
            tracing::warn!(key, "failed to update redis cache: {}", e);
            self.record_error("write", &e);
        }
    }

    /// Returns the cached value, or calls `loader` and caches what it finds.
    pub async fn get_or_load<V, F, Fut>(&self, key: &str, loader: F) -> Result<Option<V>, StoreError>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, StoreError>>,
    {
        if let Some(value) = self.read(key).await {
            inc(self.metrics.hits, &[("hit".to_string(), "true".to_string())], 1);
            return Ok(Some(value));
        }
        inc(self.metrics.hits, &[("hit".to_string(), "false".to_string())], 1);

        self.load_and_store(key, loader).await
    }

    /// Drops the cached entry; the next read goes to the loader.
    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.redis.del(self.cache_key(key)).await {
            tracing::warn!(key, "failed to invalidate cache entry: {}", e);
            self.record_error("invalidate", &e);
        }
    }

    /// Reloads the entry from the loader regardless of what redis holds.
    pub async fn warm<V, F, Fut>(&self, key: &str, loader: F) -> Result<Option<V>, StoreError>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, StoreError>>,
    {
        self.load_and_store(key, loader).await
    }

    async fn load_and_store<V, F, Fut>(&self, key: &str, loader: F) -> Result<Option<V>, StoreError>
    where
        V: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, StoreError>>,
    {
        inc(self.metrics.db_reads, &[], 1);
        let loaded = loader().await?;
        if let Some(value) = &loaded {
            self.write(key, value).await;
        }
        Ok(loaded)
    }
}
