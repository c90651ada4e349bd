use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use crate::cache::{CacheMetrics, ReadThroughCache};
use crate::cohorts::cohort_models::Cohort;
use crate::database::{DatabasePools, DatabaseTarget, StoreError};
use crate::flags::flag_models::{
    FeatureFlagList, FeatureFlagRow, GroupTypeMapping, TEAM_FLAGS_CACHE_PREFIX,
};
use crate::metrics::consts::{DB_FLAG_READS_COUNTER, FLAG_CACHE_ERRORS_COUNTER, FLAG_CACHE_HIT_COUNTER};
use crate::redis::RedisClientHandle;
use crate::team::team_models::TeamId;

/// Read-only access to what the authoring side owns: flags, cohorts and group types.
#[async_trait]
pub trait DefinitionStore {
    /// Active, non-deleted flags of a team.
    async fn fetch_flags(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<FeatureFlagList, StoreError>;

    async fn fetch_group_type_mappings(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<Vec<GroupTypeMapping>, StoreError>;

    /// Non-deleted cohorts of a team.
    async fn fetch_cohorts(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<Vec<Cohort>, StoreError>;
}

pub type DefinitionStoreHandle = Arc<dyn DefinitionStore + Send + Sync>;

#[async_trait]
impl DefinitionStore for DatabasePools {
    #[instrument(skip_all)]
    async fn fetch_flags(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<FeatureFlagList, StoreError> {
        let mut conn = self.connection(target, "fetch_flags").await?;

        let query = r#"
            SELECT f.id,
                  f.team_id,
                  f.name,
                  f.key,
                  f.filters,
                  f.deleted,
                  f.active,
                  f.ensure_experience_continuity
              FROM posthog_featureflag AS f
            WHERE f.team_id = $1
              AND f.deleted = false
              AND f.active = true
        "#;
        let rows = sqlx::query_as::<_, FeatureFlagRow>(query)
            .bind(team_id)
            .fetch_all(&mut *conn)
            .await?;

        Ok(FeatureFlagList::from_rows(rows))
    }

    async fn fetch_group_type_mappings(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<Vec<GroupTypeMapping>, StoreError> {
        let mut conn = self.connection(target, "fetch_group_type_mappings").await?;

        let query = r#"
            SELECT group_type, group_type_index
            FROM posthog_grouptypemapping
            WHERE team_id = $1
        "#;
        let mappings = sqlx::query_as::<_, GroupTypeMapping>(query)
            .bind(team_id)
            .fetch_all(&mut *conn)
            .await?;

        Ok(mappings)
    }

    async fn fetch_cohorts(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<Vec<Cohort>, StoreError> {
        let mut conn = self.connection(target, "fetch_cohorts").await?;

        let query = r#"
            SELECT c.id,
                  c.name,
                  c.team_id,
                  c.deleted,
                  c.filters,
                  c.is_static
              FROM posthog_cohort AS c
            WHERE c.team_id = $1
              AND c.deleted = false
        "#;
        let cohorts = sqlx::query_as::<_, Cohort>(query)
            .bind(team_id)
            .fetch_all(&mut *conn)
            .await?;

        Ok(cohorts)
    }
}

/// Read-through cache of a team's flag list, keyed by team id.
///
/// The authoring write path calls [`FlagDefinitionCache::invalidate`] after changing a flag,
/// or [`FlagDefinitionCache::warm`] to replace the entry in one step.
#[derive(Clone)]
pub struct FlagDefinitionCache {
    store: DefinitionStoreHandle,
    cache: ReadThroughCache,
}

impl FlagDefinitionCache {
    pub fn new(store: DefinitionStoreHandle, redis: RedisClientHandle, ttl: Duration) -> Self {
        let cache = ReadThroughCache::new(
            redis,
            TEAM_FLAGS_CACHE_PREFIX,
            ttl,
            CacheMetrics {
                hits: FLAG_CACHE_HIT_COUNTER,
                errors: FLAG_CACHE_ERRORS_COUNTER,
                db_reads: DB_FLAG_READS_COUNTER,
            },
        );
        Self { store, cache }
    }

    pub fn store(&self) -> &DefinitionStoreHandle {
        &self.store
    }

    pub async fn get_flags(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<FeatureFlagList, StoreError> {
        let flags = self
            .cache
            .get_or_load(&team_id.to_string(), || async {
                self.store.fetch_flags(target, team_id).await.map(Some)
            })
            .await?;
        Ok(flags.unwrap_or_default())
    }

    pub async fn invalidate(&self, team_id: TeamId) {
        self.cache.invalidate(&team_id.to_string()).await
    }

    pub async fn warm(&self, team_id: TeamId) -> Result<FeatureFlagList, StoreError> {
        let flags = self
            .cache
            .warm(&team_id.to_string(), || async {
                self.store
                    .fetch_flags(DatabaseTarget::Replica, team_id)
                    .await
                    .map(Some)
            })
            .await?;
        Ok(flags.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis::MockRedisClient;
    use crate::test_utils::{create_flag, InMemoryStore};

    fn flag_cache(store: &InMemoryStore, redis: &MockRedisClient) -> FlagDefinitionCache {
        FlagDefinitionCache::new(
            Arc::new(store.clone()),
            Arc::new(redis.clone()),
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn test_flags_are_cached_per_team() {
        let store = InMemoryStore::new();
        let team = store.insert_team("phc_flags");
        store.insert_flag(create_flag(team.id, "first", None));
        let redis = MockRedisClient::new();
        let cache = flag_cache(&store, &redis);

        let flags = cache.get_flags(DatabaseTarget::Replica, team.id).await.unwrap();
        assert_eq!(flags.flags.len(), 1);

        store.insert_flag(create_flag(team.id, "second", None));
        let cached = cache.get_flags(DatabaseTarget::Replica, team.id).await.unwrap();
        assert_eq!(cached.flags.len(), 1);

        cache.invalidate(team.id).await;
        let reloaded = cache.get_flags(DatabaseTarget::Replica, team.id).await.unwrap();
        assert_eq!(reloaded.flags.len(), 2);
    }

    #[tokio::test]
    async fn test_warm_replaces_stale_entry() {
        let store = InMemoryStore::new();
        let team = store.insert_team("phc_warm");
        let redis = MockRedisClient::new();
        let cache = flag_cache(&store, &redis);

        assert!(cache
            .get_flags(DatabaseTarget::Replica, team.id)
            .await
            .unwrap()
            .flags
            .is_empty());

        store.insert_flag(create_flag(team.id, "fresh", None));
        let warmed = cache.warm(team.id).await.unwrap();
        assert_eq!(warmed.flags.len(), 1);
        assert_eq!(
            cache
                .get_flags(DatabaseTarget::Replica, team.id)
                .await
                .unwrap()
                .flags[0]
                .key,
            "fresh"
        );
    }

    #[tokio::test]
    async fn test_inactive_and_deleted_flags_are_not_returned() {
        let store = InMemoryStore::new();
        let team = store.insert_team("phc_filtered");
        let mut inactive = create_flag(team.id, "inactive", None);
        inactive.active = false;
        let mut deleted = create_flag(team.id, "deleted", None);
        deleted.deleted = true;
        store.insert_flag(inactive);
        store.insert_flag(deleted);
        store.insert_flag(create_flag(team.id, "live", None));

        let flags = flag_cache(&store, &MockRedisClient::new())
            .get_flags(DatabaseTarget::Replica, team.id)
            .await
            .unwrap();
        let keys: Vec<&str> = flags.flags.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["live"]);
    }
}
