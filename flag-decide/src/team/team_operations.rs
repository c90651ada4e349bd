use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use crate::cache::{CacheMetrics, ReadThroughCache};
use crate::database::{DatabasePools, DatabaseTarget, StoreError};
use crate::metrics::consts::{DB_TEAM_READS_COUNTER, TEAM_CACHE_ERRORS_COUNTER, TEAM_CACHE_HIT_COUNTER};
use crate::redis::RedisClientHandle;
use crate::team::team_models::{Team, TEAM_TOKEN_CACHE_PREFIX};

/// Token to team lookups. `None` means the token is unknown.
#[async_trait]
pub trait TeamStore {
    async fn fetch_team_by_token(
        &self,
        target: DatabaseTarget,
        token: &str,
    ) -> Result<Option<Team>, StoreError>;
}

pub type TeamStoreHandle = Arc<dyn TeamStore + Send + Sync>;

#[async_trait]
impl TeamStore for DatabasePools {
    async fn fetch_team_by_token(
        &self,
        target: DatabaseTarget,
        token: &str,
    ) -> Result<Option<Team>, StoreError> {
        let mut conn = self.connection(target, "fetch_team").await?;

        let query = "SELECT id, name, api_token FROM posthog_team WHERE api_token = $1";
        let row = sqlx::query_as::<_, Team>(query)
            .bind(token)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row)
    }
}

/// Read-through token cache in front of a [`TeamStore`].
///
/// Writers that rotate or revoke a token call [`TeamTokenCache::invalidate`]; writers that
/// create one may call [`TeamTokenCache::warm`] so the first request doesn't pay for the lookup.
#[derive(Clone)]
pub struct TeamTokenCache {
    store: TeamStoreHandle,
    cache: ReadThroughCache,
}

impl TeamTokenCache {
    pub fn new(store: TeamStoreHandle, redis: RedisClientHandle, ttl: Duration) -> Self {
        let cache = ReadThroughCache::new(
            redis,
            TEAM_TOKEN_CACHE_PREFIX,
            ttl,
            CacheMetrics {
                hits: TEAM_CACHE_HIT_COUNTER,
                errors: TEAM_CACHE_ERRORS_COUNTER,
                db_reads: DB_TEAM_READS_COUNTER,
            },
        );
        Self { store, cache }
    }

    #[instrument(skip_all)]
    pub async fn get_team(
        &self,
        target: DatabaseTarget,
        token: &str,
    ) -> Result<Option<Team>, StoreError> {
        self.cache
            .get_or_load(token, || self.store.fetch_team_by_token(target, token))
            .await
    }

    pub async fn invalidate(&self, token: &str) {
        self.cache.invalidate(token).await
    }

    pub async fn warm(&self, token: &str) -> Result<Option<Team>, StoreError> {
        self.cache
            .warm(token, || {
                self.store
                    .fetch_team_by_token(DatabaseTarget::Replica, token)
            })
            .await
    }
}
