use serde::{Deserialize, Serialize};

use crate::cohorts::cohort_models::CohortId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorType {
    Exact,
    IsNot,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    Gt,
    Lt,
    Gte,
    Lte,
    IsSet,
    IsNotSet,
    IsDateExact,
    IsDateAfter,
    IsDateBefore,
    In,
    NotIn,
    /// Operators this service does not know, such as `semver_gt`; they fail the flag using them.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Person,
    Group,
    Cohort,
    /// Event-based criteria ("did X in the last N days"); only found inside cohort definitions.
    Behavioral,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PropertyFilter {
    #[serde(default)]
    pub key: String,
    // is_set / is_not_set filters created through the API may not carry a value
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub operator: Option<OperatorType>,
    #[serde(rename = "type")]
    pub prop_type: PropertyType,
    #[serde(default)]
    pub negation: Option<bool>,
    #[serde(default)]
    pub group_type_index: Option<i32>,
}

impl PropertyFilter {
    pub fn is_cohort(&self) -> bool {
        self.prop_type == PropertyType::Cohort
    }

    pub fn is_behavioral(&self) -> bool {
        self.prop_type == PropertyType::Behavioral
    }

    /// Negated filters match exactly the subjects the plain filter would not.
    pub fn is_negated(&self) -> bool {
        self.negation.unwrap_or(false)
    }

    pub fn has_unknown_operator(&self) -> bool {
        self.operator == Some(OperatorType::Unknown)
    }

    /// Returns the cohort id for cohort filters whose value parses as one.
    pub fn get_cohort_id(&self) -> Option<CohortId> {
        if !self.is_cohort() {
            return None;
        }
        self.value.as_ref().and_then(|value| match value {
            serde_json::Value::Number(n) => n.as_i64().map(|id| id as CohortId),
            serde_json::Value::String(s) => s.parse::<CohortId>().ok(),
            _ => None,
        })
    }
}
