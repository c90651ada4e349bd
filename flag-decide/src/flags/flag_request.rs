use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::instrument;

use crate::api::errors::FlagError;
use crate::flags::flag_matching::EvaluationRequest;
use crate::team::team_models::TeamId;

const MAX_DISTINCT_ID_LENGTH: usize = 200;

fn deserialize_distinct_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(serde_json::Number),
    }

    let opt = Option::<StringOrNumber>::deserialize(deserializer)?;
    Ok(opt.map(|val| match val {
        StringOrNumber::String(s) => s,
        StringOrNumber::Number(n) => n.to_string(),
    }))
}

/// Body of a `/decide` or `/flags` request, after transport decoding.
#[derive(Default, Debug, Deserialize)]
pub struct FlagRequest {
    #[serde(alias = "$token", alias = "api_key", default)]
    pub token: Option<String>,
    #[serde(
        alias = "$distinct_id",
        deserialize_with = "deserialize_distinct_id",
        default
    )]
    pub distinct_id: Option<String>,
    #[serde(
        alias = "$anon_distinct_id",
        deserialize_with = "deserialize_distinct_id",
        default
    )]
    pub anon_distinct_id: Option<String>,
    // accepted for client compatibility; no geoip enrichment happens here
    #[serde(default)]
    pub geoip_disable: Option<bool>,
    #[serde(default)]
    pub disable_flags: Option<bool>,
    #[serde(default)]
    pub person_properties: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub groups: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub group_properties: Option<HashMap<String, HashMap<String, Value>>>,
}

impl FlagRequest {
    /// Parses a decoded JSON body.
    #[instrument(skip_all)]
    pub fn from_bytes(bytes: Bytes) -> Result<FlagRequest, FlagError> {
        let payload = String::from_utf8(bytes.to_vec()).map_err(|e| {
            tracing::debug!("failed to decode body: {}", e);
            FlagError::RequestDecodingError(String::from("invalid body encoding"))
        })?;

        serde_json::from_str::<FlagRequest>(&payload).map_err(|e| {
            tracing::debug!("failed to parse JSON: {}", e);
            FlagError::RequestDecodingError(String::from("invalid JSON"))
        })
    }

    pub fn flags_disabled(&self) -> bool {
        self.disable_flags.unwrap_or(false)
    }

    /// The token, if the request carries a non-empty one.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|token| !token.is_empty())
    }

    pub fn extract_token(&self) -> Result<String, FlagError> {
        self.token()
            .map(str::to_string)
            .ok_or(FlagError::NoTokenError)
    }

    /// Missing or empty ids are rejected; long ones are cut to 200 characters.
    pub fn extract_distinct_id(&self) -> Result<String, FlagError> {
        match self.distinct_id.as_deref() {
            None | Some("") => Err(FlagError::MissingDistinctId),
            Some(id) => Ok(id.chars().take(MAX_DISTINCT_ID_LENGTH).collect()),
        }
    }

    /// Group property overrides, restricted to the groups the request names.
    pub fn group_property_overrides(&self) -> Option<HashMap<String, HashMap<String, Value>>> {
        let groups = self.groups.as_ref()?;
        let overrides: HashMap<String, HashMap<String, Value>> = self
            .group_properties
            .as_ref()?
            .iter()
            .filter(|(group_type, _)| groups.contains_key(*group_type))
            .map(|(group_type, properties)| (group_type.clone(), properties.clone()))
            .collect();
        (!overrides.is_empty()).then_some(overrides)
    }

    pub fn into_evaluation_request(
        self,
        team_id: TeamId,
        distinct_id: String,
    ) -> EvaluationRequest {
        let group_property_overrides = self.group_property_overrides();
        EvaluationRequest {
            team_id,
            distinct_id,
            anon_distinct_id: self.anon_distinct_id.filter(|id| !id.is_empty()),
            groups: self.groups.unwrap_or_default(),
            person_property_overrides: self.person_properties,
            group_property_overrides,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: Value) -> FlagRequest {
        FlagRequest::from_bytes(Bytes::from(body.to_string())).expect("failed to parse request")
    }

    #[test]
    fn empty_distinct_id_not_accepted() {
        let request = parse(json!({"distinct_id": "", "token": "my_token1"}));
        assert!(matches!(
            request.extract_distinct_id(),
            Err(FlagError::MissingDistinctId)
        ));
    }

    #[test]
    fn missing_distinct_id_not_accepted() {
        let request = parse(json!({"token": "my_token1"}));
        assert!(matches!(
            request.extract_distinct_id(),
            Err(FlagError::MissingDistinctId)
        ));
    }

    #[test]
    fn too_large_distinct_id_is_truncated() {
        let request = parse(json!({"distinct_id": "a".repeat(210), "token": "my_token1"}));
        assert_eq!(request.extract_distinct_id().unwrap().len(), 200);
    }

    #[test]
    fn numeric_distinct_id_is_returned_as_string() {
        let request = parse(json!({"$distinct_id": 8675309, "token": "my_token1"}));
        assert_eq!(request.extract_distinct_id().unwrap(), "8675309");
    }

    #[test]
    fn token_aliases() {
        for field in ["token", "$token", "api_key"] {
            let request = parse(json!({field: "phc_token", "distinct_id": "user"}));
            assert_eq!(request.extract_token().unwrap(), "phc_token");
        }
        assert!(matches!(
            parse(json!({"token": "", "distinct_id": "user"})).extract_token(),
            Err(FlagError::NoTokenError)
        ));
    }

    #[test]
    fn invalid_json_is_a_decoding_error() {
        assert!(matches!(
            FlagRequest::from_bytes(Bytes::from_static(b"{not json")),
            Err(FlagError::RequestDecodingError(_))
        ));
    }

    #[test]
    fn disable_flags_defaults_to_false() {
        assert!(!parse(json!({"distinct_id": "user"})).flags_disabled());
        assert!(parse(json!({"distinct_id": "user", "disable_flags": true})).flags_disabled());
    }

    #[test]
    fn group_property_overrides_only_for_named_groups() {
        let request = parse(json!({
            "distinct_id": "user",
            "groups": {"organization": "acme"},
            "group_properties": {
                "organization": {"industry": "tech"},
                "project": {"name": "unused"}
            }
        }));

        let overrides = request.group_property_overrides().unwrap();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides["organization"]["industry"], json!("tech"));
    }

    #[test]
    fn into_evaluation_request() {
        let request = parse(json!({
            "distinct_id": "user",
            "$anon_distinct_id": "anon",
            "person_properties": {"email": "a@example.com"},
        }));

        let evaluation_request = request.into_evaluation_request(7, "user".to_string());
        assert_eq!(evaluation_request.team_id, 7);
        assert_eq!(evaluation_request.anon_distinct_id.as_deref(), Some("anon"));
        assert!(evaluation_request.groups.is_empty());
        assert_eq!(
            evaluation_request.person_property_overrides.unwrap()["email"],
            json!("a@example.com")
        );
    }
}
