use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::properties::property_models::PropertyFilter;

pub type CohortId = i32;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Cohort {
    pub id: CohortId,
    pub name: Option<String>,
    pub team_id: i32,
    pub deleted: bool,
    pub filters: Option<serde_json::Value>,
    pub is_static: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CohortPropertyType {
    AND,
    OR,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CohortProperty {
    pub properties: InnerCohortProperty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InnerCohortProperty {
    #[serde(rename = "type")]
    pub prop_type: CohortPropertyType,
    pub values: Vec<CohortValues>,
}

/// One branch of the cohort tree; `prop_type` is "AND", "OR" or "property".
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CohortValues {
    #[serde(rename = "type")]
    pub prop_type: String,
    pub values: Vec<PropertyFilter>,
}
