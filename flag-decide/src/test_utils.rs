use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{json, Value};

use crate::cohorts::cohort_models::{Cohort, CohortId};
use crate::database::{DatabaseTarget, ReadinessCheck, StoreError};
use crate::flags::flag_models::{
    FeatureFlag, FeatureFlagList, FeatureFlagRow, FlagFilters, FlagPropertyGroup,
    GroupTypeIndex, GroupTypeMapping,
};
use crate::flags::flag_store::DefinitionStore;
use crate::persons::person_models::{Person, PersonId};
use crate::persons::person_operations::PersonStore;
use crate::team::team_models::{Team, TeamId};
use crate::team::team_operations::TeamStore;

pub fn random_string(prefix: &str, length: usize) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    format!("{}{}", prefix, suffix)
}

/// A boolean flag with a single condition that has no property filters.
pub fn create_flag(team_id: TeamId, key: &str, rollout_percentage: Option<f64>) -> FeatureFlag {
    FeatureFlag {
        id: rand::thread_rng().gen_range(1..10_000_000),
        team_id,
        name: Some(format!("{key} description")),
        key: key.to_string(),
        filters: FlagFilters {
            groups: vec![FlagPropertyGroup {
                properties: Some(vec![]),
                rollout_percentage,
                variant: None,
            }],
            ..Default::default()
        },
        deleted: false,
        active: true,
        ensure_experience_continuity: false,
    }
}

/// Builds a flag of team 1 from a partial definition; `key` and `filters` are the only required fields.
pub fn create_flag_from_json(definition: Value) -> FeatureFlag {
    let mut flag = json!({
        "id": rand::thread_rng().gen_range(1..10_000_000),
        "team_id": 1,
        "name": null,
        "active": true,
        "deleted": false,
        "ensure_experience_continuity": false,
    });
    if let (Some(flag), Value::Object(fields)) = (flag.as_object_mut(), definition) {
        flag.extend(fields);
    }
    serde_json::from_value(flag).expect("Failed to parse flag definition")
}

#[derive(Default)]
struct State {
    teams: HashMap<String, Team>,
    flags: Vec<FeatureFlagRow>,
    group_type_mappings: Vec<(TeamId, GroupTypeMapping)>,
    cohorts: Vec<Cohort>,
    distinct_ids: HashMap<(TeamId, String), PersonId>,
    persons: HashMap<PersonId, Option<Value>>,
    groups: HashMap<(TeamId, GroupTypeIndex, String), Value>,
    static_members: HashSet<(CohortId, PersonId)>,
    hash_key_overrides: HashMap<(TeamId, PersonId, String), String>,
    unavailable: HashSet<DatabaseTarget>,
    calls: Vec<(&'static str, DatabaseTarget)>,
    next_person_id: PersonId,
}

/// Stands in for both database connections in tests.
///
/// Every store call is recorded with the connection it was routed to, and either
/// connection can be taken down with [`InMemoryStore::set_unavailable`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the call and fails it when its connection is down.
    fn call(
        &self,
        operation: &'static str,
        target: DatabaseTarget,
    ) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut state = self.lock();
        state.calls.push((operation, target));
        if state.unavailable.contains(&target) {
            return Err(StoreError::Unavailable(target));
        }
        Ok(state)
    }

    pub fn set_unavailable(&self, target: DatabaseTarget, unavailable: bool) {
        let mut state = self.lock();
        if unavailable {
            state.unavailable.insert(target);
        } else {
            state.unavailable.remove(&target);
        }
    }

    /// Connections `operation` was called on, in call order.
    pub fn targets_for(&self, operation: &str) -> Vec<DatabaseTarget> {
        self.lock()
            .calls
            .iter()
            .filter(|(name, _)| *name == operation)
            .map(|(_, target)| *target)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn insert_team(&self, token: &str) -> Team {
        let team = Team {
            id: rand::thread_rng().gen_range(1..10_000_000),
            name: "team".to_string(),
            api_token: token.to_string(),
        };
        self.lock().teams.insert(token.to_string(), team.clone());
        team
    }

    pub fn remove_team(&self, token: &str) {
        self.lock().teams.remove(token);
    }

    pub fn insert_flag(&self, flag: FeatureFlag) {
        let filters = serde_json::to_value(&flag.filters).unwrap_or_default();
        self.insert_flag_row(FeatureFlagRow {
            id: flag.id,
            team_id: flag.team_id,
            name: flag.name,
            key: flag.key,
            filters,
            deleted: flag.deleted,
            active: flag.active,
            ensure_experience_continuity: flag.ensure_experience_continuity,
        });
    }

    /// Stores a flag as the raw row the database would return, filters unparsed.
    pub fn insert_flag_row(&self, row: FeatureFlagRow) {
        self.lock().flags.push(row);
    }

    pub fn insert_group_type_mapping(
        &self,
        team_id: TeamId,
        group_type: &str,
        group_type_index: GroupTypeIndex,
    ) {
        self.lock().group_type_mappings.push((
            team_id,
            GroupTypeMapping {
                group_type: group_type.to_string(),
                group_type_index,
            },
        ));
    }

    pub fn insert_cohort(&self, team_id: TeamId, id: CohortId, filters: Value, is_static: bool) {
        self.lock().cohorts.push(Cohort {
            id,
            name: Some(format!("cohort {id}")),
            team_id,
            deleted: false,
            filters: Some(filters),
            is_static,
        });
    }

    pub fn add_static_cohort_member(&self, cohort_id: CohortId, person_id: PersonId) {
        self.lock().static_members.insert((cohort_id, person_id));
    }

    /// Creates a person known by all of `distinct_ids`.
    pub fn insert_person(
        &self,
        team_id: TeamId,
        distinct_ids: &[&str],
        properties: Option<Value>,
    ) -> PersonId {
        let mut state = self.lock();
        state.next_person_id += 1;
        let person_id = state.next_person_id;
        state.persons.insert(person_id, properties);
        for distinct_id in distinct_ids {
            state
                .distinct_ids
                .insert((team_id, distinct_id.to_string()), person_id);
        }
        person_id
    }

    /// Attaches `new` to the person `existing` belongs to, as an identify call would.
    pub fn add_distinct_id(&self, team_id: TeamId, existing: &str, new: &str) {
        let mut state = self.lock();
        if let Some(person_id) = state
            .distinct_ids
            .get(&(team_id, existing.to_string()))
            .copied()
        {
            state.distinct_ids.insert((team_id, new.to_string()), person_id);
        }
    }

    pub fn insert_group(
        &self,
        team_id: TeamId,
        group_type_index: GroupTypeIndex,
        group_key: &str,
        properties: Value,
    ) {
        self.lock()
            .groups
            .insert((team_id, group_type_index, group_key.to_string()), properties);
    }

    pub fn insert_hash_key_override(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        flag_key: &str,
        hash_key: &str,
    ) {
        self.lock().hash_key_overrides.insert(
            (team_id, person_id, flag_key.to_string()),
            hash_key.to_string(),
        );
    }

    pub fn hash_key_override(
        &self,
        team_id: TeamId,
        person_id: PersonId,
        flag_key: &str,
    ) -> Option<String> {
        self.lock()
            .hash_key_overrides
            .get(&(team_id, person_id, flag_key.to_string()))
            .cloned()
    }

    pub fn hash_key_override_count(&self) -> usize {
        self.lock().hash_key_overrides.len()
    }
}

#[async_trait]
impl ReadinessCheck for InMemoryStore {
    async fn check_ready(&self) -> Result<(), StoreError> {
        for target in [DatabaseTarget::Primary, DatabaseTarget::Replica] {
            drop(self.call("check_ready", target)?);
        }
        Ok(())
    }
}

#[async_trait]
impl TeamStore for InMemoryStore {
    async fn fetch_team_by_token(
        &self,
        target: DatabaseTarget,
        token: &str,
    ) -> Result<Option<Team>, StoreError> {
        let state = self.call("fetch_team_by_token", target)?;
        Ok(state.teams.get(token).cloned())
    }
}

#[async_trait]
impl DefinitionStore for InMemoryStore {
    async fn fetch_flags(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<FeatureFlagList, StoreError> {
        let state = self.call("fetch_flags", target)?;
        let rows = state
            .flags
            .iter()
            .filter(|row| row.team_id == team_id && row.active && !row.deleted)
            .cloned()
            .collect();
        Ok(FeatureFlagList::from_rows(rows))
    }

    async fn fetch_group_type_mappings(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<Vec<GroupTypeMapping>, StoreError> {
        let state = self.call("fetch_group_type_mappings", target)?;
        Ok(state
            .group_type_mappings
            .iter()
            .filter(|(team, _)| *team == team_id)
            .map(|(_, mapping)| mapping.clone())
            .collect())
    }

    async fn fetch_cohorts(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
    ) -> Result<Vec<Cohort>, StoreError> {
        let state = self.call("fetch_cohorts", target)?;
        Ok(state
            .cohorts
            .iter()
            .filter(|c| c.team_id == team_id && !c.deleted)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PersonStore for InMemoryStore {
    async fn resolve_person_id(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<PersonId>, StoreError> {
        let state = self.call("resolve_person_id", target)?;
        Ok(state
            .distinct_ids
            .get(&(team_id, distinct_id.to_string()))
            .copied())
    }

    async fn fetch_person(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        distinct_id: &str,
    ) -> Result<Option<Person>, StoreError> {
        let state = self.call("fetch_person", target)?;
        let Some(person_id) = state
            .distinct_ids
            .get(&(team_id, distinct_id.to_string()))
            .copied()
        else {
            return Ok(None);
        };
        Ok(state
            .persons
            .get(&person_id)
            .map(|properties| Person::from_stored(person_id, properties.clone())))
    }

    async fn fetch_group_properties(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        group_type_index: GroupTypeIndex,
        group_key: &str,
    ) -> Result<Option<HashMap<String, Value>>, StoreError> {
        let state = self.call("fetch_group_properties", target)?;
        Ok(state
            .groups
            .get(&(team_id, group_type_index, group_key.to_string()))
            .map(|properties| match properties {
                Value::Object(map) => map.clone().into_iter().collect(),
                _ => HashMap::new(),
            }))
    }

    async fn fetch_static_cohort_memberships(
        &self,
        target: DatabaseTarget,
        person_id: PersonId,
        cohort_ids: &[CohortId],
    ) -> Result<HashSet<CohortId>, StoreError> {
        let state = self.call("fetch_static_cohort_memberships", target)?;
        Ok(cohort_ids
            .iter()
            .filter(|id| state.static_members.contains(&(**id, person_id)))
            .copied()
            .collect())
    }

    async fn fetch_hash_key_overrides(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        person_id: PersonId,
        flag_keys: &[String],
    ) -> Result<HashMap<String, String>, StoreError> {
        let state = self.call("fetch_hash_key_overrides", target)?;
        Ok(flag_keys
            .iter()
            .filter_map(|key| {
                state
                    .hash_key_overrides
                    .get(&(team_id, person_id, key.clone()))
                    .map(|hash_key| (key.clone(), hash_key.clone()))
            })
            .collect())
    }

    async fn insert_hash_key_overrides(
        &self,
        target: DatabaseTarget,
        team_id: TeamId,
        person_id: PersonId,
        flag_keys: &[String],
        hash_key: &str,
    ) -> Result<u64, StoreError> {
        let mut state = self.call("insert_hash_key_overrides", target)?;
        let mut written = 0;
        for key in flag_keys {
            let entry = state
                .hash_key_overrides
                .entry((team_id, person_id, key.clone()));
            if let std::collections::hash_map::Entry::Vacant(vacant) = entry {
                vacant.insert(hash_key.to_string());
                written += 1;
            }
        }
        Ok(written)
    }
}
