use std::collections::HashMap;
use std::io::Read;
use std::str::FromStr;

use axum::http::{header::CONTENT_TYPE, HeaderMap};
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tracing::instrument;

use crate::api::errors::{ClientFacingError, FlagError};
use crate::api::types::{ApiVersion, FlagsResponse};
use crate::config::FlexBool;
use crate::database::replica_router::{ReplicaRouter, RowSet};
use crate::database::{DatabaseTarget, StoreError};
use crate::flags::flag_matching::FeatureFlagMatcher;
use crate::flags::flag_models::FeatureFlagList;
use crate::flags::flag_request::FlagRequest;
use crate::metrics::consts::{
    FLAG_DEFINITIONS_PRIMARY_FALLBACK_COUNTER, FLAG_EVALUATION_ERROR_COUNTER,
    FLAG_REQUESTS_COUNTER, FLAG_REQUESTS_DISABLED_COUNTER, FLAG_REQUEST_KLUDGE_COUNTER,
    TOKEN_VALIDATION_ERRORS_COUNTER,
};
use crate::metrics::utils::inc;
use crate::router;
use crate::team::team_models::TeamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Compression {
    #[serde(rename = "gzip", alias = "gzip-js")]
    Gzip,
    #[serde(rename = "base64")]
    Base64,
    #[serde(other)]
    Unsupported,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Base64 => "base64",
            Compression::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FlagsQueryParams {
    /// Response version, 1 to 3
    #[serde(alias = "v")]
    pub version: Option<String>,

    pub compression: Option<Compression>,

    #[serde(alias = "ver")]
    pub lib_version: Option<String>,

    /// `reasons=true` adds per-flag evaluation details to v3 responses
    pub reasons: Option<String>,
}

impl FlagsQueryParams {
    pub fn include_reasons(&self) -> bool {
        self.reasons
            .as_deref()
            .and_then(|r| FlexBool::from_str(r).ok())
            .is_some_and(|r| *r)
    }
}

pub struct RequestContext {
    pub state: router::State,
    pub headers: HeaderMap,
    pub meta: FlagsQueryParams,
    pub body: Bytes,
}

/// Handles one flags request, in this order:
/// 1) decode the body,
/// 2) answer `disable_flags` requests without touching anything else,
/// 3) admit through the per-token rate limiter,
/// 4) resolve the token to a team,
/// 5) evaluate the team's flags for the distinct id. Unreadable definitions give an
///    empty answer with `errorsWhileComputingFlags` set, not an error response.
#[instrument(skip_all)]
pub async fn process_request(context: RequestContext) -> Result<FlagsResponse, FlagError> {
    let RequestContext {
        state,
        headers,
        meta,
        body,
    } = context;

    let version = ApiVersion::from_query(meta.version.as_deref())?;
    let request = decode_request(&headers, body, &meta)?;

    if request.flags_disabled() {
        inc(FLAG_REQUESTS_DISABLED_COUNTER, &[], 1);
        return Ok(FlagsResponse::disabled(version));
    }

    if !state.rate_limiter.allow_request(request.token()) {
        return Err(FlagError::ClientFacing(ClientFacingError::RateLimited));
    }

    let token = request.extract_token()?;
    let router = ReplicaRouter::new();
    let Some(team) = state
        .teams
        .get_team(router.route_read(RowSet::Teams), &token)
        .await?
    else {
        inc(TOKEN_VALIDATION_ERRORS_COUNTER, &[], 1);
        return Err(FlagError::TokenValidationError);
    };

    let distinct_id = request.extract_distinct_id()?;
    inc(
        FLAG_REQUESTS_COUNTER,
        &[("team_id".to_string(), team.id.to_string())],
        1,
    );

    let (flags, definitions_failed) = match load_flags(&state, &router, team.id).await {
        Ok(flags) => (flags, false),
        Err(e) => {
            tracing::error!(team_id = team.id, error = %e, "flag definitions unavailable");
            inc(
                FLAG_EVALUATION_ERROR_COUNTER,
                &[("reason".to_string(), "flag_definitions_unavailable".to_string())],
                1,
            );
            (FeatureFlagList::default(), true)
        }
    };

    let mut matcher = FeatureFlagMatcher::new(
        request.into_evaluation_request(team.id, distinct_id),
        state.persons.clone(),
        state.flag_definitions.store().clone(),
        router,
    );
    let mut evaluation = matcher.evaluate_all_feature_flags(&flags.flags).await;
    if definitions_failed || flags.had_deserialization_errors {
        evaluation.errors_while_computing_flags = true;
    }

    Ok(FlagsResponse::from_evaluation(
        version,
        &evaluation,
        meta.include_reasons(),
    ))
}

/// Reads the team's flags where the router sends them, retrying once on the
/// primary when the replica read fails.
async fn load_flags(
    state: &router::State,
    router: &ReplicaRouter,
    team_id: TeamId,
) -> Result<FeatureFlagList, StoreError> {
    let target = router.route_read(RowSet::FlagDefinitions);
    match state.flag_definitions.get_flags(target, team_id).await {
        Err(e) if target == DatabaseTarget::Replica => {
            tracing::warn!(team_id, error = %e, "replica flag read failed, retrying on primary");
            inc(FLAG_DEFINITIONS_PRIMARY_FALLBACK_COUNTER, &[], 1);
            state
                .flag_definitions
                .get_flags(DatabaseTarget::Primary, team_id)
                .await
        }
        result => result,
    }
}

/// Reads the body according to its content type and the `compression` query parameter.
pub fn decode_request(
    headers: &HeaderMap,
    body: Bytes,
    query: &FlagsQueryParams,
) -> Result<FlagRequest, FlagError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");

    let base_content_type = content_type.split(';').next().unwrap_or("").trim();

    match base_content_type {
        "application/json" | "text/plain" => {
            let decoded_body = decode_body(body, query.compression, headers)?;
            FlagRequest::from_bytes(decoded_body)
        }
        "application/x-www-form-urlencoded" => decode_form_data(body, query.compression),
        _ => Err(FlagError::RequestDecodingError(format!(
            "unsupported content type: {content_type}"
        ))),
    }
}

fn decode_body(
    body: Bytes,
    compression: Option<Compression>,
    headers: &HeaderMap,
) -> Result<Bytes, FlagError> {
    if let Some(compression) = compression {
        return match compression {
            Compression::Gzip => decompress_gzip(body),
            Compression::Base64 => decode_base64(body),
            Compression::Unsupported => Err(FlagError::RequestDecodingError(
                "Unsupported compression type".to_string(),
            )),
        };
    }

    let gzip_encoded = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|encoding| encoding.contains("gzip"));
    if gzip_encoded {
        return decompress_gzip(body);
    }

    // some clients gzip without saying so
    if body.starts_with(&[0x1f, 0x8b]) {
        inc(
            FLAG_REQUEST_KLUDGE_COUNTER,
            &[("type".to_string(), "auto_detected_gzip".to_string())],
            1,
        );
        return decompress_gzip(body);
    }

    Ok(body)
}

fn decompress_gzip(compressed: Bytes) -> Result<Bytes, FlagError> {
    let mut decoder = GzDecoder::new(&compressed[..]);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).map_err(|e| {
        tracing::debug!("gzip decompression failed: {}", e);
        FlagError::RequestDecodingError(format!("gzip decompression failed: {}", e))
    })?;
    Ok(Bytes::from(decompressed))
}

fn decode_base64(body: Bytes) -> Result<Bytes, FlagError> {
    let decoded = general_purpose::STANDARD
        .decode(body)
        .map_err(|e| FlagError::RequestDecodingError(format!("Base64 decoding error: {}", e)))?;
    Ok(Bytes::from(decoded))
}

/// Form bodies carry base64 JSON in a `data` field, or as the whole body.
fn decode_form_data(body: Bytes, compression: Option<Compression>) -> Result<FlagRequest, FlagError> {
    if compression == Some(Compression::Gzip) {
        return Err(FlagError::RequestDecodingError(
            "Gzip compression not supported for form-urlencoded data".into(),
        ));
    }

    let mut fields: HashMap<String, String> = serde_urlencoded::from_bytes(&body).map_err(|e| {
        tracing::debug!("failed to parse form data: {}", e);
        FlagError::RequestDecodingError("invalid form data".into())
    })?;
    let encoded = match fields.remove("data") {
        Some(data) => data,
        None => {
            inc(
                FLAG_REQUEST_KLUDGE_COUNTER,
                &[("type".to_string(), "missing_data_prefix".to_string())],
                1,
            );
            String::from_utf8_lossy(&body).into_owned()
        }
    };

    // form decoding turns an unescaped '+' of the base64 alphabet into a space
    let mut cleaned = encoded.trim().replace(' ', "+");
    let padding_needed = cleaned.len() % 4;
    if padding_needed > 0 {
        cleaned.push_str(&"=".repeat(4 - padding_needed));
    }

    let decoded = decode_base64(Bytes::from(cleaned))?;
    let json = String::from_utf8_lossy(&decoded);
    serde_json::from_str(&json).map_err(|e| {
        tracing::debug!("failed to parse JSON: {}", e);
        FlagError::RequestDecodingError("invalid JSON structure".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use flate2::write::GzEncoder;
    use flate2::Compression as FlateCompression;
    use serde_json::json;
    use std::io::Write;

    fn gzipped(data: &str) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), FlateCompression::default());
        encoder.write_all(data.as_bytes()).unwrap();
        Bytes::from(encoder.finish().unwrap())
    }

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        headers
    }

    fn query(compression: Option<Compression>) -> FlagsQueryParams {
        FlagsQueryParams {
            compression,
            ..Default::default()
        }
    }

    fn body() -> String {
        json!({"token": "phc_token", "distinct_id": "user"}).to_string()
    }

    #[test]
    fn test_plain_json() {
        let request =
            decode_request(&headers("application/json"), Bytes::from(body()), &query(None))
                .unwrap();
        assert_eq!(request.extract_distinct_id().unwrap(), "user");
    }

    #[test]
    fn test_text_plain_json() {
        let request = decode_request(
            &headers("text/plain; charset=utf-8"),
            Bytes::from(body()),
            &query(None),
        )
        .unwrap();
        assert_eq!(request.extract_token().unwrap(), "phc_token");
    }

    #[test]
    fn test_gzip_with_query_parameter() {
        let request = decode_request(
            &headers("application/json"),
            gzipped(&body()),
            &query(Some(Compression::Gzip)),
        )
        .unwrap();
        assert_eq!(request.extract_distinct_id().unwrap(), "user");
    }

    #[test]
    fn test_gzip_detected_from_magic_bytes() {
        let request =
            decode_request(&headers("application/json"), gzipped(&body()), &query(None)).unwrap();
        assert_eq!(request.extract_distinct_id().unwrap(), "user");
    }

    #[test]
    fn test_base64_body() {
        let encoded = general_purpose::STANDARD.encode(body());
        let request = decode_request(
            &headers("application/json"),
            Bytes::from(encoded),
            &query(Some(Compression::Base64)),
        )
        .unwrap();
        assert_eq!(request.extract_distinct_id().unwrap(), "user");
    }

    #[test]
    fn test_form_data_field() {
        let encoded = general_purpose::STANDARD.encode(body());
        let form = serde_urlencoded::to_string([("data", encoded)]).unwrap();
        let request = decode_request(
            &headers("application/x-www-form-urlencoded"),
            Bytes::from(form),
            &query(None),
        )
        .unwrap();
        assert_eq!(request.extract_token().unwrap(), "phc_token");
    }

    #[test]
    fn test_unsupported_content_type() {
        assert!(matches!(
            decode_request(&headers("image/png"), Bytes::from(body()), &query(None)),
            Err(FlagError::RequestDecodingError(_))
        ));
    }

    #[test]
    fn test_unsupported_compression() {
        assert!(decode_request(
            &headers("application/json"),
            Bytes::from(body()),
            &query(Some(Compression::Unsupported)),
        )
        .is_err());
    }

    #[test]
    fn test_include_reasons() {
        let with = |reasons: Option<&str>| FlagsQueryParams {
            reasons: reasons.map(str::to_string),
            ..Default::default()
        };
        assert!(with(Some("true")).include_reasons());
        assert!(with(Some("1")).include_reasons());
        assert!(!with(Some("false")).include_reasons());
        assert!(!with(Some("garbage")).include_reasons());
        assert!(!with(None).include_reasons());
    }
}
