use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::api::errors::{ClientFacingError, FlagError};
use crate::flags::flag_matching::{FeatureFlagMatch, FlagsEvaluation};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Boolean(bool),
    String(String),
}

impl FlagValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            FlagValue::Boolean(b) => *b,
            FlagValue::String(_) => true,
        }
    }
}

/// Response shape requested through the `v` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApiVersion {
    V1,
    V2,
    V3,
}

impl ApiVersion {
    /// Missing means v1; anything newer than v3 gets v3.
    pub fn from_query(v: Option<&str>) -> Result<Self, FlagError> {
        let Some(raw) = v.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(ApiVersion::V1);
        };
        let version: f64 = raw.parse().map_err(|_| {
            FlagError::ClientFacing(ClientFacingError::BadRequest(format!(
                "invalid api version '{raw}'"
            )))
        })?;
        Ok(if version >= 3.0 {
            ApiVersion::V3
        } else if version >= 2.0 {
            ApiVersion::V2
        } else {
            ApiVersion::V1
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlagEvaluationReason {
    pub code: String,
    pub condition_index: Option<usize>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FlagDetails {
    pub key: String,
    pub enabled: bool,
    pub variant: Option<String>,
    pub reason: FlagEvaluationReason,
}

impl FlagDetails {
    pub fn from_match(key: &str, flag_match: &FeatureFlagMatch) -> Self {
        let description = match (flag_match.reason.as_str(), flag_match.condition_index) {
            ("condition_match", Some(index)) => Some(format!("Matched condition set {}", index + 1)),
            ("out_of_rollout_bound", Some(index)) => Some(format!(
                "Out of rollout bound for condition set {}",
                index + 1
            )),
            ("no_condition_match", _) => Some("No matching condition set".to_string()),
            ("no_group_type", _) => Some("No group supplied for this flag".to_string()),
            _ => None,
        };

        FlagDetails {
            key: key.to_string(),
            enabled: flag_match.matches,
            variant: flag_match.variant.clone(),
            reason: FlagEvaluationReason {
                code: flag_match.reason.to_string(),
                condition_index: flag_match.condition_index,
                description,
            },
        }
    }
}

/// v1 body: the keys of every truthy flag.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyFlagsResponse {
    pub feature_flags: Vec<String>,
}

/// v2 and v3 body.
#[derive(Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors_while_computing_flags: Option<bool>,
    pub feature_flags: HashMap<String, FlagValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_flag_payloads: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_flag_details: Option<HashMap<String, FlagDetails>>,
}

#[derive(Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FlagsResponse {
    Legacy(LegacyFlagsResponse),
    Decide(DecideResponse),
}

impl FlagsResponse {
    /// Body for `disable_flags` requests: no flags, no errors.
    pub fn disabled(version: ApiVersion) -> Self {
        FlagsResponse::Decide(DecideResponse {
            errors_while_computing_flags: (version > ApiVersion::V1).then_some(false),
            feature_flags: HashMap::new(),
            feature_flag_payloads: None,
            feature_flag_details: None,
        })
    }

    pub fn from_evaluation(
        version: ApiVersion,
        evaluation: &FlagsEvaluation,
        include_reasons: bool,
    ) -> Self {
        if version == ApiVersion::V1 {
            let mut feature_flags: Vec<String> = evaluation
                .values()
                .into_iter()
                .filter(|(_, value)| value.is_truthy())
                .map(|(key, _)| key)
                .collect();
            feature_flags.sort();
            return FlagsResponse::Legacy(LegacyFlagsResponse { feature_flags });
        }

        let is_v3 = version == ApiVersion::V3;
        FlagsResponse::Decide(DecideResponse {
            errors_while_computing_flags: Some(evaluation.errors_while_computing_flags),
            feature_flags: evaluation.values(),
            feature_flag_payloads: is_v3.then(|| evaluation.payloads()),
            feature_flag_details: (is_v3 && include_reasons).then(|| evaluation.details()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::flag_match_reason::FeatureFlagMatchReason;
    use serde_json::json;
    use test_case::test_case;

    fn evaluation() -> FlagsEvaluation {
        let mut evaluation = FlagsEvaluation::default();
        evaluation.flags.insert(
            "on".to_string(),
            FeatureFlagMatch {
                matches: true,
                variant: None,
                reason: FeatureFlagMatchReason::ConditionMatch,
                condition_index: Some(0),
                payload: Some(json!({"color": "blue"})),
            },
        );
        evaluation.flags.insert(
            "variant".to_string(),
            FeatureFlagMatch {
                matches: true,
                variant: Some("test".to_string()),
                reason: FeatureFlagMatchReason::ConditionMatch,
                condition_index: Some(1),
                payload: None,
            },
        );
        evaluation.flags.insert(
            "off".to_string(),
            FeatureFlagMatch {
                matches: false,
                variant: None,
                reason: FeatureFlagMatchReason::OutOfRolloutBound,
                condition_index: Some(0),
                payload: None,
            },
        );
        evaluation.errors_while_computing_flags = true;
        evaluation
    }

    #[test_case(None, ApiVersion::V1)]
    #[test_case(Some(""), ApiVersion::V1)]
    #[test_case(Some("1"), ApiVersion::V1)]
    #[test_case(Some("2"), ApiVersion::V2)]
    #[test_case(Some("3"), ApiVersion::V3)]
    #[test_case(Some("4"), ApiVersion::V3)]
    fn test_api_version_from_query(v: Option<&str>, expected: ApiVersion) {
        assert_eq!(ApiVersion::from_query(v).unwrap(), expected);
    }

    #[test]
    fn test_invalid_api_version() {
        assert!(ApiVersion::from_query(Some("latest")).is_err());
    }

    #[test]
    fn test_v1_lists_truthy_flags() {
        let response = FlagsResponse::from_evaluation(ApiVersion::V1, &evaluation(), false);
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            json!({"featureFlags": ["on", "variant"]})
        );
    }

    #[test]
    fn test_v2_shape() {
        let response = FlagsResponse::from_evaluation(ApiVersion::V2, &evaluation(), true);
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            json!({
                "errorsWhileComputingFlags": true,
                "featureFlags": {"on": true, "variant": "test", "off": false}
            })
        );
    }

    #[test]
    fn test_v3_shape_with_reasons() {
        let response = FlagsResponse::from_evaluation(ApiVersion::V3, &evaluation(), true);
        let body = serde_json::to_value(response).unwrap();

        assert_eq!(body["featureFlagPayloads"], json!({"on": {"color": "blue"}}));
        assert_eq!(
            body["featureFlagDetails"]["off"]["reason"],
            json!({
                "code": "out_of_rollout_bound",
                "condition_index": 0,
                "description": "Out of rollout bound for condition set 1"
            })
        );
        assert_eq!(body["featureFlagDetails"]["variant"]["variant"], "test");
    }

    #[test]
    fn test_v3_without_reasons_has_no_details() {
        let response = FlagsResponse::from_evaluation(ApiVersion::V3, &evaluation(), false);
        let body = serde_json::to_value(response).unwrap();
        assert!(body.get("featureFlagDetails").is_none());
    }

    #[test]
    fn test_disabled_bodies() {
        assert_eq!(
            serde_json::to_value(FlagsResponse::disabled(ApiVersion::V1)).unwrap(),
            json!({"featureFlags": {}})
        );
        assert_eq!(
            serde_json::to_value(FlagsResponse::disabled(ApiVersion::V3)).unwrap(),
            json!({"featureFlags": {}, "errorsWhileComputingFlags": false})
        );
    }
}
