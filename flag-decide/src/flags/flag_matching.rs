use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::instrument;

use crate::api::errors::FlagError;
use crate::api::types::{FlagDetails, FlagValue};
use crate::cohorts::cohort_models::CohortId;
use crate::cohorts::cohort_operations::{CohortMembershipOracle, StaticMemberships};
use crate::database::replica_router::{ReplicaRouter, RowSet};
use crate::database::DatabaseTarget;
use crate::flags::experience_continuity::ExperienceContinuityResolver;
use crate::flags::flag_hashing::{flag_hash, is_in_rollout, VARIANT_NAMESPACE};
use crate::flags::flag_match_reason::FeatureFlagMatchReason;
use crate::flags::flag_models::{FeatureFlag, GroupTypeIndex};
use crate::flags::flag_store::DefinitionStoreHandle;
use crate::flags::flag_variants::{select_variant, validate_variants};
use crate::metrics::consts::{
    FLAG_EVALUATION_ERROR_COUNTER, FLAG_EVALUATION_TIME, FLAG_GET_MATCH_TIME,
};
use crate::metrics::utils::{inc, timing_guard};
use crate::persons::person_models::{Person, PersonId};
use crate::persons::person_operations::PersonStoreHandle;
use crate::properties::property_matching::match_filters;
use crate::properties::property_models::PropertyFilter;
use crate::team::team_models::TeamId;

/// Who a request evaluates flags for, and the overrides it brought along.
#[derive(Debug, Clone, Default)]
pub struct EvaluationRequest {
    pub team_id: TeamId,
    pub distinct_id: String,
    pub anon_distinct_id: Option<String>,
    pub groups: HashMap<String, Value>,
    pub person_property_overrides: Option<HashMap<String, Value>>,
    pub group_property_overrides: Option<HashMap<String, HashMap<String, Value>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFlagMatch {
    pub matches: bool,
    pub variant: Option<String>,
    pub reason: FeatureFlagMatchReason,
    pub condition_index: Option<usize>,
    pub payload: Option<Value>,
}

impl FeatureFlagMatch {
    fn miss(reason: FeatureFlagMatchReason, condition_index: Option<usize>) -> Self {
        FeatureFlagMatch {
            matches: false,
            variant: None,
            reason,
            condition_index,
            payload: None,
        }
    }

    pub fn get_flag_value(&self) -> FlagValue {
        match (self.matches, &self.variant) {
            (true, Some(variant)) => FlagValue::String(variant.clone()),
            (true, None) => FlagValue::Boolean(true),
            (false, _) => FlagValue::Boolean(false),
        }
    }
}

/// Per-request result: every flag that evaluated, and whether any flag failed to.
#[derive(Debug, Clone, Default)]
pub struct FlagsEvaluation {
    pub flags: HashMap<String, FeatureFlagMatch>,
    pub errors_while_computing_flags: bool,
}

impl FlagsEvaluation {
    pub fn values(&self) -> HashMap<String, FlagValue> {
        self.flags
            .iter()
            .map(|(key, m)| (key.clone(), m.get_flag_value()))
            .collect()
    }

    /// Payloads of flags that are currently on.
    pub fn payloads(&self) -> HashMap<String, Value> {
        self.flags
            .iter()
            .filter(|(_, m)| m.matches)
            .filter_map(|(key, m)| m.payload.clone().map(|p| (key.clone(), p)))
            .collect()
    }

    pub fn details(&self) -> HashMap<String, FlagDetails> {
        self.flags
            .iter()
            .map(|(key, m)| (key.clone(), FlagDetails::from_match(key, m)))
            .collect()
    }
}

/// A lookup done at most once per request. A failure is remembered so every
/// flag depending on it fails the same way without hitting the database again.
#[derive(Debug, Default)]
enum Fetched<T> {
    #[default]
    NotFetched,
    Loaded(T),
    Failed(DatabaseTarget),
}

fn replay_failure(target: DatabaseTarget) -> FlagError {
    FlagError::StoreError(crate::database::StoreError::Unavailable(target))
}

/// The identity a flag hashes on. Group flags carry the group they resolved to.
struct Subject {
    salt: String,
    group: Option<(GroupTypeIndex, String)>,
}

/// Evaluates one request's flags.
///
/// Person, group, cohort and override lookups happen lazily, only for flags that need
/// them, and at most once per request. A lookup failure fails the flags that needed it;
/// the others still evaluate.
pub struct FeatureFlagMatcher {
    request: EvaluationRequest,
    persons: PersonStoreHandle,
    definitions: DefinitionStoreHandle,
    router: ReplicaRouter,
    hash_keys: HashMap<String, String>,
    continuity_failed: bool,
    cohort_roots: HashSet<CohortId>,
    group_type_mappings: Fetched<HashMap<GroupTypeIndex, String>>,
    cohorts: Fetched<CohortMembershipOracle>,
    person: Fetched<Option<Person>>,
    group_properties: HashMap<GroupTypeIndex, Fetched<HashMap<String, Value>>>,
}

impl FeatureFlagMatcher {
    pub fn new(
        request: EvaluationRequest,
        persons: PersonStoreHandle,
        definitions: DefinitionStoreHandle,
        router: ReplicaRouter,
    ) -> Self {
        FeatureFlagMatcher {
            request,
            persons,
            definitions,
            router,
            hash_keys: HashMap::new(),
            continuity_failed: false,
            cohort_roots: HashSet::new(),
            group_type_mappings: Fetched::NotFetched,
            cohorts: Fetched::NotFetched,
            person: Fetched::NotFetched,
            group_properties: HashMap::new(),
        }
    }

    #[instrument(skip_all, fields(team_id = %self.request.team_id, distinct_id = %self.request.distinct_id))]
    pub async fn evaluate_all_feature_flags(&mut self, flags: &[FeatureFlag]) -> FlagsEvaluation {
        let team_labels = [("team_id".to_string(), self.request.team_id.to_string())];
        let _evaluation_timer = timing_guard(FLAG_EVALUATION_TIME, &team_labels);
        let evaluable: Vec<&FeatureFlag> = flags.iter().filter(|f| f.is_evaluable()).collect();

        self.cohort_roots = evaluable.iter().flat_map(|f| f.cohort_ids()).collect();
        self.resolve_continuity(&evaluable).await;

        let mut evaluation = FlagsEvaluation::default();
        for flag in evaluable {
            let timer = timing_guard(FLAG_GET_MATCH_TIME, &team_labels);
            let result = self.evaluate_flag(flag).await;
            timer.fin();

            match result {
                Ok(flag_match) => {
                    tracing::debug!(
                        flag = %flag.key,
                        reason = %flag_match.reason,
                        condition_index = ?flag_match.condition_index,
                        "evaluated flag"
                    );
                    evaluation.flags.insert(flag.key.clone(), flag_match);
                }
                Err(e) => {
                    tracing::warn!(flag = %flag.key, error = %e, "failed to evaluate flag");
                    inc(
                        FLAG_EVALUATION_ERROR_COUNTER,
                        &[("reason".to_string(), e.error_code().to_string())],
                        1,
                    );
                    evaluation.errors_while_computing_flags = true;
                }
            }
        }
        evaluation
    }

    async fn resolve_continuity(&mut self, flags: &[&FeatureFlag]) {
        let keys: Vec<String> = flags
            .iter()
            .filter(|f| f.needs_continuity())
            .map(|f| f.key.clone())
            .collect();
        if keys.is_empty() {
            return;
        }

        let outcome = ExperienceContinuityResolver::new(
            self.persons.as_ref(),
            &self.router,
            self.request.team_id,
        )
        .resolve(
            &self.request.distinct_id,
            self.request.anon_distinct_id.as_deref(),
            &keys,
        )
        .await;

        match outcome {
            Ok(outcome) => self.hash_keys = outcome.hash_keys,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read hash key overrides");
                self.continuity_failed = true;
            }
        }
    }

    /// Evaluates one flag: conditions in declaration order, first full match wins.
    pub async fn evaluate_flag(&mut self, flag: &FeatureFlag) -> Result<FeatureFlagMatch, FlagError> {
        validate_variants(&flag.key, flag.get_variants())?;

        let Some(subject) = self.subject_for(flag).await? else {
            return Ok(FeatureFlagMatch::miss(
                FeatureFlagMatchReason::NoGroupType,
                None,
            ));
        };

        let mut properties: Option<HashMap<String, Value>> = None;
        let mut best_miss = FeatureFlagMatch::miss(FeatureFlagMatchReason::NoConditionMatch, None);

        for (index, condition) in flag.get_conditions().iter().enumerate() {
            let filters = condition.filters();
            if !filters.is_empty() {
                let target_properties = match properties.take() {
                    Some(loaded) => loaded,
                    None => self.properties_for(flag, &subject).await?,
                };
                let matched = self.filters_match(filters, &target_properties).await?;
                properties = Some(target_properties);
                if !matched {
                    continue;
                }
            }

            if !is_in_rollout(&flag.key, &subject.salt, condition.rollout_percentage) {
                if best_miss.reason < FeatureFlagMatchReason::OutOfRolloutBound {
                    best_miss =
                        FeatureFlagMatch::miss(FeatureFlagMatchReason::OutOfRolloutBound, Some(index));
                }
                continue;
            }

            let variant = match condition.variant.as_deref() {
                Some(variant) if flag.has_variant(variant) => Some(variant.to_string()),
                _ => select_variant(
                    flag_hash(&flag.key, &subject.salt, VARIANT_NAMESPACE),
                    flag.get_variants(),
                )
                .map(str::to_string),
            };
            let payload = if flag.get_variants().is_empty() {
                flag.get_payload("true")
            } else {
                variant.as_deref().and_then(|v| flag.get_payload(v))
            };

            return Ok(FeatureFlagMatch {
                matches: true,
                variant,
                reason: FeatureFlagMatchReason::ConditionMatch,
                condition_index: Some(index),
                payload,
            });
        }

        Ok(best_miss)
    }

    async fn filters_match(
        &mut self,
        filters: &[PropertyFilter],
        properties: &HashMap<String, Value>,
    ) -> Result<bool, FlagError> {
        if filters.iter().any(|f| f.is_cohort()) {
            let oracle = self.cohort_oracle().await?;
            match_filters(filters, properties, oracle)
        } else {
            match_filters(filters, properties, &CohortMembershipOracle::default())
        }
    }

    /// `None` when the flag targets a group the request didn't name.
    async fn subject_for(&mut self, flag: &FeatureFlag) -> Result<Option<Subject>, FlagError> {
        if let Some(group_type_index) = flag.get_group_type_index() {
            let mappings = self.group_type_mappings().await?;
            let Some(group_type) = mappings.get(&group_type_index).cloned() else {
                return Ok(None);
            };
            let group_key = match self.request.groups.get(&group_type) {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return Ok(None),
            };
            return Ok(Some(Subject {
                salt: group_key,
                group: Some((group_type_index, group_type)),
            }));
        }

        let salt = if flag.needs_continuity() {
            if self.continuity_failed {
                return Err(FlagError::ContinuityUnavailable);
            }
            self.hash_keys
                .get(&flag.key)
                .cloned()
                .unwrap_or_else(|| self.request.distinct_id.clone())
        } else {
            self.request.distinct_id.clone()
        };
        Ok(Some(Subject { salt, group: None }))
    }

    /// Properties the flag's filters are matched against.
    ///
    /// Request overrides are enough on their own when they cover every filter key and no
    /// filter needs a cohort; otherwise stored properties are loaded and overrides win.
    async fn properties_for(
        &mut self,
        flag: &FeatureFlag,
        subject: &Subject,
    ) -> Result<HashMap<String, Value>, FlagError> {
        let filters: Vec<&PropertyFilter> = flag
            .get_conditions()
            .iter()
            .flat_map(|c| c.filters())
            .collect();

        match &subject.group {
            None => {
                let overrides = self.request.person_property_overrides.clone();
                if let Some(local) = locally_computable(overrides.as_ref(), &filters) {
                    return Ok(local);
                }
                let mut properties = self.stored_person_properties().await?;
                properties.extend(overrides.unwrap_or_default());
                Ok(properties)
            }
            Some((group_type_index, group_type)) => {
                let overrides = self
                    .request
                    .group_property_overrides
                    .as_ref()
                    .and_then(|o| o.get(group_type))
                    .cloned();
                if let Some(local) = locally_computable(overrides.as_ref(), &filters) {
                    return Ok(local);
                }
                let mut properties = self
                    .stored_group_properties(*group_type_index, &subject.salt)
                    .await?;
                properties.extend(overrides.unwrap_or_default());
                Ok(properties)
            }
        }
    }

    async fn load_person(&mut self) -> Result<Option<&Person>, FlagError> {
        if let Fetched::NotFetched = self.person {
            let target = self.router.route_read(RowSet::PersonProperties);
            match self
                .persons
                .fetch_person(target, self.request.team_id, &self.request.distinct_id)
                .await
            {
                Ok(person) => self.person = Fetched::Loaded(person),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to fetch person properties");
                    self.person = Fetched::Failed(target);
                    return Err(e.into());
                }
            }
        }
        match &self.person {
            Fetched::Loaded(person) => Ok(person.as_ref()),
            Fetched::Failed(target) => Err(replay_failure(*target)),
            Fetched::NotFetched => Ok(None),
        }
    }

    async fn stored_person_properties(&mut self) -> Result<HashMap<String, Value>, FlagError> {
        let mut properties = self
            .load_person()
            .await?
            .map(|person| person.properties.clone())
            .unwrap_or_default();
        properties.insert(
            "distinct_id".to_string(),
            Value::String(self.request.distinct_id.clone()),
        );
        Ok(properties)
    }

    async fn person_id(&mut self) -> Result<Option<PersonId>, FlagError> {
        Ok(self.load_person().await?.map(|person| person.id))
    }

    async fn stored_group_properties(
        &mut self,
        group_type_index: GroupTypeIndex,
        group_key: &str,
    ) -> Result<HashMap<String, Value>, FlagError> {
        let entry = self.group_properties.entry(group_type_index).or_default();
        if let Fetched::NotFetched = entry {
            let target = self.router.route_read(RowSet::GroupProperties);
            match self
                .persons
                .fetch_group_properties(target, self.request.team_id, group_type_index, group_key)
                .await
            {
                Ok(properties) => *entry = Fetched::Loaded(properties.unwrap_or_default()),
                Err(e) => {
                    tracing::warn!(error = %e, group_type_index, "failed to fetch group properties");
                    *entry = Fetched::Failed(target);
                    return Err(e.into());
                }
            }
        }
        match entry {
            Fetched::Loaded(properties) => Ok(properties.clone()),
            Fetched::Failed(target) => Err(replay_failure(*target)),
            Fetched::NotFetched => Ok(HashMap::new()),
        }
    }

    async fn group_type_mappings(&mut self) -> Result<&HashMap<GroupTypeIndex, String>, FlagError> {
        if let Fetched::NotFetched = self.group_type_mappings {
            let target = self.router.route_read(RowSet::FlagDefinitions);
            match self
                .definitions
                .fetch_group_type_mappings(target, self.request.team_id)
                .await
            {
                Ok(mappings) => {
                    self.group_type_mappings = Fetched::Loaded(
                        mappings
                            .into_iter()
                            .map(|m| (m.group_type_index, m.group_type))
                            .collect(),
                    )
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to fetch group type mappings");
                    self.group_type_mappings = Fetched::Failed(target);
                    return Err(e.into());
                }
            }
        }
        match &self.group_type_mappings {
            Fetched::Loaded(mappings) => Ok(mappings),
            Fetched::Failed(target) => Err(replay_failure(*target)),
            Fetched::NotFetched => Err(FlagError::Internal(
                "group type mappings were not loaded".to_string(),
            )),
        }
    }

    /// Cohort definitions plus this person's static memberships, loaded together on first use.
    async fn cohort_oracle(&mut self) -> Result<&CohortMembershipOracle, FlagError> {
        if let Fetched::NotFetched = self.cohorts {
            let target = self.router.route_read(RowSet::FlagDefinitions);
            match self
                .definitions
                .fetch_cohorts(target, self.request.team_id)
                .await
            {
                Ok(cohorts) => {
                    let mut oracle = CohortMembershipOracle::new(cohorts, StaticMemberships::default());
                    let static_ids = oracle.static_cohorts_reachable_from(&self.cohort_roots);
                    if !static_ids.is_empty() {
                        oracle.set_static_memberships(self.static_memberships(static_ids).await);
                    }
                    self.cohorts = Fetched::Loaded(oracle);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to fetch cohorts");
                    self.cohorts = Fetched::Failed(target);
                    return Err(e.into());
                }
            }
        }
        match &self.cohorts {
            Fetched::Loaded(oracle) => Ok(oracle),
            Fetched::Failed(target) => Err(replay_failure(*target)),
            Fetched::NotFetched => Err(FlagError::Internal("cohorts were not loaded".to_string())),
        }
    }

    async fn static_memberships(&mut self, cohort_ids: HashSet<CohortId>) -> StaticMemberships {
        let person_id = match self.person_id().await {
            Ok(Some(person_id)) => person_id,
            Ok(None) => return StaticMemberships::default(),
            Err(_) => {
                let target = match self.person {
                    Fetched::Failed(target) => target,
                    _ => DatabaseTarget::Replica,
                };
                return StaticMemberships::Unavailable(target);
            }
        };

        let target = self.router.route_read(RowSet::StaticCohortMembership);
        let cohort_ids: Vec<CohortId> = cohort_ids.into_iter().collect();
        match self
            .persons
            .fetch_static_cohort_memberships(target, person_id, &cohort_ids)
            .await
        {
            Ok(members) => StaticMemberships::Known(members),
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch static cohort memberships");
                StaticMemberships::Unavailable(target)
            }
        }
    }
}

/// The request's overrides, when they alone can decide every filter of a flag.
fn locally_computable(
    overrides: Option<&HashMap<String, Value>>,
    filters: &[&PropertyFilter],
) -> Option<HashMap<String, Value>> {
    let overrides = overrides?;
    if filters.iter().any(|f| f.is_cohort()) {
        return None;
    }
    filters
        .iter()
        .all(|f| overrides.contains_key(&f.key))
        .then(|| overrides.clone())
}
