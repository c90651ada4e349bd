use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;

use crate::cohorts::cohort_models::CohortId;
use crate::database::{DatabasePools, DatabaseTarget, StoreError};
use crate::flags::flag_models::GroupTypeIndex;
use crate::metrics::consts::FLAG_DB_PROPERTIES_FETCH_TIME;
use crate::metrics::utils::timing_guard;
use crate::persons::person_models::{Person, PersonId};
use crate::team::team_models::TeamId;

/// Identity and property lookups, plus the hash key override table.
///
/// Every call names the connection it runs on; callers pick it through a
/// [`ReplicaRouter`](crate::database::replica_router::ReplicaRouter).
#[async_trait]
pub trait PersonStore {
    async fn resolve_person_id(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<PersonId>, StoreError>;

    async fn fetch_person(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError>;

    async fn fetch_group_properties(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        group_type_index: GroupTypeIndex,
        group_key: &str,
    ) -> Result<Option<HashMap<String, Value>>, StoreError>;

    /// The subset of `cohort_ids` the person is a static member of.
    async fn fetch_static_cohort_memberships(
        &self,
        target: DatabaseTarget,
        person_id: PersonId,
        cohort_ids: &[CohortId],
    ) -> Result<HashSet<CohortId>, StoreError>;

    /// Existing overrides for the person, restricted to `flag_keys`, as flag key to hash key.
    async fn fetch_hash_key_overrides(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        person_id: PersonId,
        flag_keys: &[String],
    ) -> Result<HashMap<String, String>, StoreError>;

    /// Inserts one override per flag key. Rows that already exist are left as they are.
    /// Returns how many rows were written.
    async fn insert_hash_key_overrides(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        person_id: PersonId,
        flag_keys: &[String],
        hash_key: &str,
    ) -> Result<u64, StoreError>;
}

pub type PersonStoreHandle = Arc<dyn PersonStore + Send + Sync>;

#[async_trait]
impl PersonStore for DatabasePools {
    async fn resolve_person_id(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<PersonId>, StoreError> {
        let mut conn = self.connection(target, "resolve_person_id").await?;

        let query = r#"
            SELECT person_id
            FROM posthog_persondistinctid
            WHERE team_id = $1 AND distinct_id = $2
            LIMIT 1
        "#;
        let person_id: Option<PersonId> = sqlx::query_scalar(query)
            .bind(team_id)
            .bind(distinct_id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(person_id)
    }

    async fn fetch_person(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError> {
        let mut conn = self.connection(target, "fetch_person_properties").await?;
        let labels = [("pool".to_string(), target.as_str().to_string())];
        let _timer = timing_guard(FLAG_DB_PROPERTIES_FETCH_TIME, &labels).label("kind", "person");

        // person ingestion can lag behind the first flags request for a distinct_id,
        // so a missing row is expected and not an error
        let query = r#"
            SELECT DISTINCT ON (ppd.distinct_id)
                p.id AS person_id,
                p.properties AS person_properties
            FROM posthog_persondistinctid ppd
            INNER JOIN posthog_person p
                ON p.id = ppd.person_id
                AND p.team_id = ppd.team_id
            WHERE ppd.distinct_id = $1
                AND ppd.team_id = $2
        "#;
        let row: Option<(PersonId, Option<Value>)> = sqlx::query_as(query)
            .bind(distinct_id)
            .bind(team_id)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(row.map(|(id, properties)| Person::from_stored(id, properties)))
    }

    async fn fetch_group_properties(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        group_type_index: GroupTypeIndex,
        group_key: &str,
    ) -> Result<Option<HashMap<String, Value>>, StoreError> {
        let mut conn = self.connection(target, "fetch_group_properties").await?;
        let labels = [("pool".to_string(), target.as_str().to_string())];
        let _timer = timing_guard(FLAG_DB_PROPERTIES_FETCH_TIME, &labels).label("kind", "group");

        let query = r#"
            SELECT group_properties
            FROM posthog_group
            WHERE team_id = $1
                AND group_type_index = $2
                AND group_key = $3
        "#;
        let properties: Option<Value> = sqlx::query_scalar(query)
            .bind(team_id)
            .bind(group_type_index)
            .bind(group_key)
            .fetch_optional(&mut *conn)
            .await?;

        Ok(properties.map(|value| match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => HashMap::new(),
        }))
    }

    async fn fetch_static_cohort_memberships(
        &self,
        target: DatabaseTarget,
        person_id: PersonId,
        cohort_ids: &[CohortId],
    ) -> Result<HashSet<CohortId>, StoreError> {
        if cohort_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut conn = self.connection(target, "fetch_static_cohort_memberships").await?;

        let query = r#"
            SELECT cohort_id
            FROM posthog_cohortpeople
            WHERE person_id = $1
                AND cohort_id = ANY($2)
        "#;
        let rows: Vec<CohortId> = sqlx::query_scalar(query)
            .bind(person_id)
            .bind(cohort_ids)
            .fetch_all(&mut *conn)
            .await?;

        Ok(rows.into_iter().collect())
    }

    async fn fetch_hash_key_overrides(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        person_id: PersonId,
        flag_keys: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.connection(target, "fetch_hash_key_overrides").await?;

        let query = r#"
            SELECT feature_flag_key, hash_key
            FROM posthog_featureflaghashkeyoverride
            WHERE team_id = $1
                AND person_id = $2
                AND feature_flag_key = ANY($3)
        "#;
        let rows = sqlx::query(query)
            .bind(team_id)
            .bind(person_id)
            .bind(flag_keys)
            .fetch_all(&mut *conn)
            .await?;

        rows.into_iter()
            .map(|row| {
                let flag_key: String = row.try_get("feature_flag_key")?;
                let hash_key: String = row.try_get("hash_key")?;
                Ok::<_, StoreError>((flag_key, hash_key))
            })
            .collect()
    }

    async fn insert_hash_key_overrides(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        person_id: PersonId,
        flag_keys: &[String],
        hash_key: &str,
    ) -> Result<u64, StoreError> {
        if flag_keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection(target, "insert_hash_key_overrides").await?;

        // first writer wins: a concurrent request for the same person and flag is a no-op
        let query = r#"
            INSERT INTO posthog_featureflaghashkeyoverride (team_id, person_id, feature_flag_key, hash_key)
            SELECT $1, $2, flag_key, $3
            FROM UNNEST($4::text[]) AS t(flag_key)
            ON CONFLICT DO NOTHING
        "#;
        let result = sqlx::query(query)
            .bind(team_id)
            .bind(person_id)
            .bind(hash_key)
            .bind(flag_keys)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected())
    }
}
