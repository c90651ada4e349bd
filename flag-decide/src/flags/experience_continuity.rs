use std::collections::HashMap;

use tracing::instrument;

use crate::database::replica_router::{ReplicaRouter, RowSet};
use crate::database::StoreError;
use crate::metrics::consts::{
    FLAG_HASH_KEY_PROCESSING_TIME, FLAG_HASH_KEY_WRITES_COUNTER,
    FLAG_HASH_KEY_WRITE_FAILURES_COUNTER,
};
use crate::metrics::utils::{inc, timing_guard};
use crate::persons::person_models::PersonId;
use crate::persons::person_operations::PersonStore;
use crate::team::team_models::TeamId;

/// The salt every continuity flag hashes with for this request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContinuityOutcome {
    pub hash_keys: HashMap<String, String>,
    /// Set when pinning failed and the request fell back to the distinct id.
    pub write_failed: bool,
}

/// Keeps a person's assignments stable across identity merges by pinning the
/// salt of continuity flags to the identifier they were first evaluated with.
pub struct ExperienceContinuityResolver<'a> {
    store: &'a (dyn PersonStore + Send + Sync),
    router: &'a ReplicaRouter,
    team_id: TeamId,
}

impl<'a> ExperienceContinuityResolver<'a> {
    pub fn new(
        store: &'a (dyn PersonStore + Send + Sync),
        router: &'a ReplicaRouter,
        team_id: TeamId,
    ) -> Self {
        Self {
            store,
            router,
            team_id,
        }
    }

    /// Resolves the salt of each flag in `flag_keys`.
    ///
    /// Fails only when the person or their existing overrides can't be read; a failed
    /// override write falls back to `distinct_id` and is reported in the outcome.
    #[instrument(skip_all, fields(team_id = %self.team_id, flags = flag_keys.len()))]
    pub async fn resolve(
        &self,
        distinct_id: &str,
        anon_distinct_id: Option<&str>,
        flag_keys: &[String],
    ) -> Result<ContinuityOutcome, StoreError> {
        let labels = [("team_id".to_string(), self.team_id.to_string())];
        let _timer = timing_guard(FLAG_HASH_KEY_PROCESSING_TIME, &labels);

        let unpinned = |hash_keys: &HashMap<String, String>| -> HashMap<String, String> {
            flag_keys
                .iter()
                .map(|key| {
                    let salt = hash_keys
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| distinct_id.to_string());
                    (key.clone(), salt)
                })
                .collect()
        };

        let Some(person_id) = self
            .store
            .resolve_person_id(self.router.route_read(RowSet::Persons), self.team_id, distinct_id)
            .await?
        else {
            // not ingested yet; the assignment may move once the person exists
            return Ok(ContinuityOutcome {
                hash_keys: unpinned(&HashMap::new()),
                write_failed: false,
            });
        };

        let mut overrides = self.read_overrides(person_id, flag_keys).await?;

        let missing: Vec<String> = flag_keys
            .iter()
            .filter(|key| !overrides.contains_key(*key))
            .cloned()
            .collect();

        let mut write_failed = false;
        if let (false, Some(anon_distinct_id)) = (missing.is_empty(), anon_distinct_id) {
            match self.pin(person_id, anon_distinct_id, &missing).await {
                Ok(true) => overrides = self.read_overrides(person_id, flag_keys).await?,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        team_id = self.team_id,
                        person_id,
                        "failed to write hash key overrides, using distinct_id: {}",
                        e
                    );
                    inc(
                        FLAG_HASH_KEY_WRITE_FAILURES_COUNTER,
                        &[("reason".to_string(), error_reason(&e).to_string())],
                        1,
                    );
                    write_failed = true;
                }
            }
        }

        Ok(ContinuityOutcome {
            hash_keys: unpinned(&overrides),
            write_failed,
        })
    }

    async fn read_overrides(
        &self,
        person_id: PersonId,
        flag_keys: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        self.store
            .fetch_hash_key_overrides(
                self.router.route_read(RowSet::HashKeyOverrides),
                self.team_id,
                person_id,
                flag_keys,
            )
            .await
    }

    /// Writes `anon_distinct_id` as the hash key of `missing`, but only when it belongs to
    /// the same person. Returns whether a write was issued.
    async fn pin(
        &self,
        person_id: PersonId,
        anon_distinct_id: &str,
        missing: &[String],
    ) -> Result<bool, StoreError> {
        let anon_person_id = self
            .store
            .resolve_person_id(
                self.router.route_read(RowSet::Persons),
                self.team_id,
                anon_distinct_id,
            )
            .await?;
        if anon_person_id != Some(person_id) {
            return Ok(false);
        }

        let written = self
            .store
            .insert_hash_key_overrides(
                self.router.route_write(RowSet::HashKeyOverrides),
                self.team_id,
                person_id,
                missing,
                anon_distinct_id,
            )
            .await?;
        inc(FLAG_HASH_KEY_WRITES_COUNTER, &[], written);
        Ok(true)
    }
}

fn error_reason(error: &StoreError) -> &'static str {
    if error.is_timeout() {
        "timeout"
    } else {
        match error {
            StoreError::Unavailable(_) => "unavailable",
            _ => "database",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseTarget;
    use crate::test_utils::InMemoryStore;

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_unknown_person_uses_distinct_id() {
        let store = InMemoryStore::new();
        let router = ReplicaRouter::new();
        let resolver = ExperienceContinuityResolver::new(&store, &router, 1);

        let outcome = resolver
            .resolve("new_user", Some("anon"), &keys(&["flag"]))
            .await
            .unwrap();

        assert_eq!(outcome.hash_keys["flag"], "new_user");
        assert!(!outcome.write_failed);
        assert_eq!(store.hash_key_override_count(), 0);
    }

    #[tokio::test]
    async fn test_pins_anon_id_when_same_person() {
        let store = InMemoryStore::new();
        let person_id = store.insert_person(1, &["user_id", "anon_id"], None);
        let router = ReplicaRouter::new();
        let resolver = ExperienceContinuityResolver::new(&store, &router, 1);

        let outcome = resolver
            .resolve("user_id", Some("anon_id"), &keys(&["a", "b"]))
            .await
            .unwrap();

        assert_eq!(outcome.hash_keys["a"], "anon_id");
        assert_eq!(outcome.hash_keys["b"], "anon_id");
        assert_eq!(
            store.hash_key_override(1, person_id, "a"),
            Some("anon_id".to_string())
        );
    }

    #[tokio::test]
    async fn test_does_not_pin_anon_id_of_another_person() {
        let store = InMemoryStore::new();
        store.insert_person(1, &["user_id"], None);
        store.insert_person(1, &["someone_else"], None);
        let router = ReplicaRouter::new();
        let resolver = ExperienceContinuityResolver::new(&store, &router, 1);

        let outcome = resolver
            .resolve("user_id", Some("someone_else"), &keys(&["a"]))
            .await
            .unwrap();

        assert_eq!(outcome.hash_keys["a"], "user_id");
        assert_eq!(store.hash_key_override_count(), 0);
    }

    #[tokio::test]
    async fn test_existing_override_is_never_replaced() {
        let store = InMemoryStore::new();
        let person_id = store.insert_person(1, &["user_id", "anon_1", "anon_2"], None);
        store.insert_hash_key_override(1, person_id, "a", "anon_1");
        let router = ReplicaRouter::new();
        let resolver = ExperienceContinuityResolver::new(&store, &router, 1);

        let outcome = resolver
            .resolve("user_id", Some("anon_2"), &keys(&["a"]))
            .await
            .unwrap();

        assert_eq!(outcome.hash_keys["a"], "anon_1");
        // nothing was missing, so nothing was written
        assert!(!router.has_written(RowSet::HashKeyOverrides));
    }

    #[tokio::test]
    async fn test_override_reads_after_write_go_to_primary() {
        let store = InMemoryStore::new();
        store.insert_person(1, &["user_id", "anon_id"], None);
        let router = ReplicaRouter::new();
        let resolver = ExperienceContinuityResolver::new(&store, &router, 1);

        resolver
            .resolve("user_id", Some("anon_id"), &keys(&["a"]))
            .await
            .unwrap();

        assert_eq!(
            store.targets_for("fetch_hash_key_overrides"),
            vec![DatabaseTarget::Replica, DatabaseTarget::Primary]
        );
        assert_eq!(
            store.targets_for("insert_hash_key_overrides"),
            vec![DatabaseTarget::Primary]
        );
        assert!(store
            .targets_for("resolve_person_id")
            .iter()
            .all(|t| *t == DatabaseTarget::Replica));
    }

    #[tokio::test]
    async fn test_write_failure_falls_back_to_distinct_id() {
        let store = InMemoryStore::new();
        store.insert_person(1, &["user_id", "anon_id"], None);
        store.set_unavailable(DatabaseTarget::Primary, true);
        let router = ReplicaRouter::new();
        let resolver = ExperienceContinuityResolver::new(&store, &router, 1);

        let outcome = resolver
            .resolve("user_id", Some("anon_id"), &keys(&["a"]))
            .await
            .unwrap();

        assert_eq!(outcome.hash_keys["a"], "user_id");
        assert!(outcome.write_failed);
    }

    #[tokio::test]
    async fn test_read_failure_is_an_error() {
        let store = InMemoryStore::new();
        store.insert_person(1, &["user_id"], None);
        store.set_unavailable(DatabaseTarget::Replica, true);
        let router = ReplicaRouter::new();
        let resolver = ExperienceContinuityResolver::new(&store, &router, 1);

        assert!(resolver
            .resolve("user_id", None, &keys(&["a"]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stable_after_distinct_id_change() {
        let store = InMemoryStore::new();
        store.insert_person(1, &["anon_id"], None);
        let flags = keys(&["a"]);

        // first visit, anonymous, then identify as user_id
        store.add_distinct_id(1, "anon_id", "user_id");
        let router = ReplicaRouter::new();
        let identified = ExperienceContinuityResolver::new(&store, &router, 1)
            .resolve("user_id", Some("anon_id"), &flags)
            .await
            .unwrap();
        assert_eq!(identified.hash_keys["a"], "anon_id");

        // later the person shows up under yet another distinct id
        store.add_distinct_id(1, "anon_id", "user_id_2");
        let router = ReplicaRouter::new();
        let later = ExperienceContinuityResolver::new(&store, &router, 1)
            .resolve("user_id_2", None, &flags)
            .await
            .unwrap();
        assert_eq!(later.hash_keys["a"], "anon_id");
    }

    #[tokio::test]
    async fn test_concurrent_pins_agree() {
        let store = InMemoryStore::new();
        let person_id = store.insert_person(1, &["user_id", "anon_1", "anon_2"], None);
        let flags = keys(&["a"]);
        let (router_1, router_2) = (ReplicaRouter::new(), ReplicaRouter::new());
        let first = ExperienceContinuityResolver::new(&store, &router_1, 1);
        let second = ExperienceContinuityResolver::new(&store, &router_2, 1);

        let (one, two) = tokio::join!(
            first.resolve("user_id", Some("anon_1"), &flags),
            second.resolve("user_id", Some("anon_2"), &flags)
        );
        let (one, two) = (one.unwrap(), two.unwrap());

        assert_eq!(one.hash_keys["a"], two.hash_keys["a"]);
        assert_eq!(store.hash_key_override_count(), 1);
        assert_eq!(
            store.hash_key_override(1, person_id, "a"),
            Some(one.hash_keys["a"].clone())
        );
    }
}
