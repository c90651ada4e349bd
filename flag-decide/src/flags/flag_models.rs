use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::cohorts::cohort_models::CohortId;
use crate::properties::property_models::PropertyFilter;

pub type FeatureFlagId = i32;
pub type GroupTypeIndex = i32;

pub const TEAM_FLAGS_CACHE_PREFIX: &str = "flag_decide:team_flags:";

/// One condition of a flag. Conditions are tried in the order they are declared.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct FlagPropertyGroup {
    #[serde(default)]
    pub properties: Option<Vec<PropertyFilter>>,
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    #[serde(default)]
    pub variant: Option<String>,
}

impl FlagPropertyGroup {
    pub fn filters(&self) -> &[PropertyFilter] {
        self.properties.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultivariateFlagVariant {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    pub rollout_percentage: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultivariateFlagOptions {
    pub variants: Vec<MultivariateFlagVariant>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct FlagFilters {
    #[serde(default)]
    pub groups: Vec<FlagPropertyGroup>,
    #[serde(default)]
    pub multivariate: Option<MultivariateFlagOptions>,
    #[serde(default)]
    pub aggregation_group_type_index: Option<GroupTypeIndex>,
    #[serde(default)]
    pub payloads: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureFlag {
    pub id: FeatureFlagId,
    pub team_id: i32,
    pub name: Option<String>,
    pub key: String,
    pub filters: FlagFilters,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub ensure_experience_continuity: bool,
}

impl FeatureFlag {
    pub fn get_group_type_index(&self) -> Option<GroupTypeIndex> {
        self.filters.aggregation_group_type_index
    }

    pub fn get_conditions(&self) -> &Vec<FlagPropertyGroup> {
        &self.filters.groups
    }

    pub fn get_variants(&self) -> &[MultivariateFlagVariant] {
        self.filters
            .multivariate
            .as_ref()
            .map(|m| m.variants.as_slice())
            .unwrap_or_default()
    }

    pub fn has_variant(&self, key: &str) -> bool {
        self.get_variants().iter().any(|v| v.key == key)
    }

    pub fn get_payload(&self, match_val: &str) -> Option<serde_json::Value> {
        self.filters
            .payloads
            .as_ref()
            .and_then(|payloads| payloads.as_object())
            .and_then(|payloads| payloads.get(match_val).cloned())
    }

    pub fn is_evaluable(&self) -> bool {
        self.active && !self.deleted
    }

    /// Continuity only applies to person flags.
    pub fn needs_continuity(&self) -> bool {
        self.ensure_experience_continuity && self.get_group_type_index().is_none()
    }

    /// Cohorts referenced directly by any condition.
    pub fn cohort_ids(&self) -> HashSet<CohortId> {
        self.get_conditions()
            .iter()
            .flat_map(|condition| condition.filters())
            .filter_map(|filter| filter.get_cohort_id())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeatureFlagRow {
    pub id: i32,
    pub team_id: i32,
    pub name: Option<String>,
    pub key: String,
    pub filters: serde_json::Value,
    pub deleted: bool,
    pub active: bool,
    pub ensure_experience_continuity: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FeatureFlagList {
    pub flags: Vec<FeatureFlag>,
    /// Set when at least one stored definition could not be parsed and was left out.
    #[serde(default)]
    pub had_deserialization_errors: bool,
}

impl FeatureFlagList {
    pub fn new(flags: Vec<FeatureFlag>) -> Self {
        Self {
            flags,
            had_deserialization_errors: false,
        }
    }

    /// Parses every row on its own; a row whose filters don't parse is dropped and flagged.
    pub fn from_rows(rows: Vec<FeatureFlagRow>) -> Self {
        let mut had_deserialization_errors = false;
        let flags = rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<FlagFilters>(row.filters) {
                Ok(filters) => Some(FeatureFlag {
                    id: row.id,
                    team_id: row.team_id,
                    name: row.name,
                    key: row.key,
                    filters,
                    deleted: row.deleted,
                    active: row.active,
                    ensure_experience_continuity: row.ensure_experience_continuity,
                }),
                Err(e) => {
                    tracing::error!(
                        flag = %row.key,
                        team_id = row.team_id,
                        "Failed to deserialize filters: {}",
                        e
                    );
                    had_deserialization_errors = true;
                    None
                }
            })
            .collect();

        Self {
            flags,
            had_deserialization_errors,
        }
    }
}

/// Maps a group dimension index (as stored on a flag) to the group type name requests use.
#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct GroupTypeMapping {
    pub group_type: String,
    pub group_type_index: GroupTypeIndex,
}
