use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::DiGraph;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::api::errors::FlagError;
use crate::cohorts::cohort_models::{
    Cohort, CohortId, CohortProperty, CohortPropertyType, CohortValues, InnerCohortProperty,
};
use crate::database::{DatabaseTarget, StoreError};
use crate::properties::property_matching::match_property_filter;
use crate::properties::property_models::{OperatorType, PropertyFilter};

impl Cohort {
    /// Parses the filters JSON; `None` when the cohort has no filters at all.
    pub fn parse_filters(&self) -> Result<Option<CohortProperty>, FlagError> {
        let Some(filters) = &self.filters else {
            return Ok(None);
        };
        // static cohorts are stored with an empty filters object
        if filters.as_object().is_some_and(|o| o.is_empty()) {
            return Ok(None);
        }

        serde_json::from_value(filters.clone())
            .map(Some)
            .map_err(|e| {
                tracing::error!("Failed to parse filters for cohort {}: {}", self.id, e);
                FlagError::CohortFiltersParsingError
            })
    }

    /// Cohort ids this cohort's filters reference directly.
    pub fn extract_dependencies(&self) -> Result<HashSet<CohortId>, FlagError> {
        let mut dependencies = HashSet::new();
        for filter in self.leaf_filters()? {
            if filter.is_cohort() {
                let cohort_id = filter
                    .get_cohort_id()
                    .ok_or(FlagError::CohortFiltersParsingError)?;
                dependencies.insert(cohort_id);
            }
        }
        Ok(dependencies)
    }

    pub fn has_behavioral_filters(&self) -> Result<bool, FlagError> {
        Ok(self.leaf_filters()?.iter().any(|f| f.is_behavioral()))
    }

    fn leaf_filters(&self) -> Result<Vec<PropertyFilter>, FlagError> {
        Ok(self
            .parse_filters()?
            .map(|property| property.properties.to_inner())
            .unwrap_or_default())
    }
}

impl InnerCohortProperty {
    /// Flattens the two-level AND/OR tree into its leaf filters.
    pub fn to_inner(self) -> Vec<PropertyFilter> {
        self.values
            .into_iter()
            .flat_map(|value| value.values)
            .collect()
    }

    pub fn evaluate(
        &self,
        target_properties: &HashMap<String, Value>,
        cohort_matches: &HashMap<CohortId, bool>,
    ) -> Result<bool, FlagError> {
        match self.prop_type {
            CohortPropertyType::OR => {
                for cohort_values in &self.values {
                    if evaluate_cohort_values(cohort_values, target_properties, cohort_matches)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            CohortPropertyType::AND => {
                for cohort_values in &self.values {
                    if !evaluate_cohort_values(cohort_values, target_properties, cohort_matches)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

fn evaluate_filter(
    filter: &PropertyFilter,
    target_properties: &HashMap<String, Value>,
    cohort_matches: &HashMap<CohortId, bool>,
) -> Result<bool, FlagError> {
    if filter.is_cohort() {
        apply_cohort_membership_logic(std::slice::from_ref(filter), cohort_matches)
    } else {
        match_property_filter(filter, target_properties)
    }
}

fn evaluate_cohort_values(
    values: &CohortValues,
    target_properties: &HashMap<String, Value>,
    cohort_matches: &HashMap<CohortId, bool>,
) -> Result<bool, FlagError> {
    match values.prop_type.as_str() {
        "OR" => {
            for filter in &values.values {
                if evaluate_filter(filter, target_properties, cohort_matches)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        "AND" | "property" => {
            for filter in &values.values {
                if !evaluate_filter(filter, target_properties, cohort_matches)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Err(FlagError::CohortFiltersParsingError),
    }
}

/// Applies `in` / `not_in` to already-known memberships. Every filter must hold.
pub fn apply_cohort_membership_logic(
    cohort_filters: &[PropertyFilter],
    cohort_matches: &HashMap<CohortId, bool>,
) -> Result<bool, FlagError> {
    for filter in cohort_filters {
        let cohort_id = filter
            .get_cohort_id()
            .ok_or(FlagError::CohortFiltersParsingError)?;
        let matches = cohort_matches.get(&cohort_id).copied().unwrap_or(false);

        let membership_match = match filter.operator.unwrap_or(OperatorType::In) {
            OperatorType::In | OperatorType::Exact => matches,
            OperatorType::NotIn => !matches,
            OperatorType::Unknown => {
                return Err(FlagError::UnsupportedOperator(filter.key.clone()));
            }
            _ => false,
        };

        if membership_match == filter.is_negated() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Answers "is this subject in cohort X?" for the property matcher.
///
/// Implementations return `FlagError::UnsupportedCohort` for cohorts that
/// depend on behavioral criteria, so only the flag asking fails.
pub trait CohortOracle {
    fn is_member(
        &self,
        cohort_id: CohortId,
        properties: &HashMap<String, Value>,
    ) -> Result<bool, FlagError>;
}

/// Static cohort memberships for the current person, as loaded for this request.
#[derive(Debug, Clone)]
pub enum StaticMemberships {
    Known(HashSet<CohortId>),
    Unavailable(DatabaseTarget),
}

impl Default for StaticMemberships {
    fn default() -> Self {
        StaticMemberships::Known(HashSet::new())
    }
}

/// Cohort oracle over one request's cohort snapshot.
#[derive(Debug, Default)]
pub struct CohortMembershipOracle {
    cohorts: HashMap<CohortId, Cohort>,
    static_memberships: StaticMemberships,
}

impl CohortMembershipOracle {
    pub fn new(cohorts: Vec<Cohort>, static_memberships: StaticMemberships) -> Self {
        Self {
            cohorts: cohorts.into_iter().map(|c| (c.id, c)).collect(),
            static_memberships,
        }
    }

    fn get(&self, cohort_id: CohortId) -> Result<&Cohort, FlagError> {
        self.cohorts
            .get(&cohort_id)
            .ok_or(FlagError::CohortNotFound(cohort_id))
    }

    fn static_match(&self, cohort_id: CohortId) -> Result<bool, FlagError> {
        match &self.static_memberships {
            StaticMemberships::Known(members) => Ok(members.contains(&cohort_id)),
            StaticMemberships::Unavailable(target) => {
                Err(FlagError::StoreError(StoreError::Unavailable(*target)))
            }
        }
    }

    /// Static cohorts reachable from `roots`, including through dynamic cohorts.
    pub fn static_cohorts_reachable_from(&self, roots: &HashSet<CohortId>) -> HashSet<CohortId> {
        let mut seen = HashSet::new();
        let mut statics = HashSet::new();
        let mut queue: VecDeque<CohortId> = roots.iter().copied().collect();

        while let Some(cohort_id) = queue.pop_front() {
            if !seen.insert(cohort_id) {
                continue;
            }
            let Some(cohort) = self.cohorts.get(&cohort_id) else {
                continue;
            };
            if cohort.is_static {
                statics.insert(cohort_id);
                continue;
            }
            if let Ok(dependencies) = cohort.extract_dependencies() {
                queue.extend(dependencies);
            }
        }
        statics
    }

    pub fn set_static_memberships(&mut self, static_memberships: StaticMemberships) {
        self.static_memberships = static_memberships;
    }

    /// Evaluates a dynamic cohort after its dependencies, in topological order.
    fn evaluate_dynamic_cohort(
        &self,
        initial_cohort_id: CohortId,
        target_properties: &HashMap<String, Value>,
    ) -> Result<bool, FlagError> {
        let graph = self.build_cohort_dependency_graph(initial_cohort_id)?;

        let sorted = toposort(&graph, None).map_err(|e| {
            FlagError::CohortDependencyCycle(format!("Cyclic dependency detected: {:?}", e))
        })?;

        let mut evaluation_results = HashMap::new();

        // edges point from a cohort to its dependencies, so walk in reverse
        for node in sorted.into_iter().rev() {
            let cohort_id = graph[node];
            let cohort = self.get(cohort_id)?;

            if cohort.is_static {
                evaluation_results.insert(cohort_id, self.static_match(cohort_id)?);
                continue;
            }

            let matches = match cohort.parse_filters()? {
                Some(property) => property
                    .properties
                    .evaluate(target_properties, &evaluation_results)?,
                None => false,
            };
            evaluation_results.insert(cohort_id, matches);
        }

        evaluation_results
            .get(&initial_cohort_id)
            .copied()
            .ok_or(FlagError::CohortNotFound(initial_cohort_id))
    }

    /// Breadth-first walk from `initial_cohort_id`, adding an edge from each cohort
    /// to every cohort it references. Behavioral criteria anywhere in the walk fail it.
    fn build_cohort_dependency_graph(
        &self,
        initial_cohort_id: CohortId,
    ) -> Result<DiGraph<CohortId, ()>, FlagError> {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();
        let mut queue = VecDeque::new();

        queue.push_back(initial_cohort_id);
        node_map.insert(initial_cohort_id, graph.add_node(initial_cohort_id));

        while let Some(cohort_id) = queue.pop_front() {
            let cohort = self.get(cohort_id)?;
            if cohort.is_static {
                continue;
            }
            if cohort.has_behavioral_filters()? {
                return Err(FlagError::UnsupportedCohort(cohort_id));
            }

            for dep_id in cohort.extract_dependencies()? {
                let current_node = node_map[&cohort_id];
                let is_new_dep = !node_map.contains_key(&dep_id);
                let dep_node = *node_map
                    .entry(dep_id)
                    .or_insert_with(|| graph.add_node(dep_id));
                graph.add_edge(current_node, dep_node, ());
                if is_new_dep {
                    queue.push_back(dep_id);
                }
            }
        }

        if is_cyclic_directed(&graph) {
            return Err(FlagError::CohortDependencyCycle(format!(
                "Cyclic dependency detected starting at cohort {}",
                initial_cohort_id
            )));
        }

        Ok(graph)
    }
}

impl CohortOracle for CohortMembershipOracle {
    fn is_member(
        &self,
        cohort_id: CohortId,
        properties: &HashMap<String, Value>,
    ) -> Result<bool, FlagError> {
        if self.get(cohort_id)?.is_static {
            return self.static_match(cohort_id);
        }
        self.evaluate_dynamic_cohort(cohort_id, properties)
    }
}
