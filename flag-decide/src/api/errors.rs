use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

use crate::cohorts::cohort_models::CohortId;
use crate::database::StoreError;

/// Error body in the `{type, code, detail, attr}` shape clients already parse.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub detail: String,
    pub attr: Option<String>,
}

impl ErrorResponse {
    fn new(error_type: &str, code: &str, detail: String) -> Self {
        ErrorResponse {
            error_type: error_type.to_string(),
            code: code.to_string(),
            detail,
            attr: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientFacingError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Rate limited")]
    RateLimited,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error(transparent)]
    ClientFacing(#[from] ClientFacingError),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("No distinct_id in request")]
    MissingDistinctId,
    #[error("No api_key in request")]
    NoTokenError,
    #[error("API key is not valid")]
    TokenValidationError,
    #[error(transparent)]
    StoreError(#[from] StoreError),

    // Errors below only ever fail a single flag
    #[error("Cohort {0} uses behavioral filters, which can't be evaluated here")]
    UnsupportedCohort(CohortId),
    #[error("Cohort {0} not found")]
    CohortNotFound(CohortId),
    #[error("Failed to parse cohort filters")]
    CohortFiltersParsingError,
    #[error("Cohort dependency cycle: {0}")]
    CohortDependencyCycle(String),
    #[error("Unsupported operator in filter on property {0}")]
    UnsupportedOperator(String),
    #[error("Invalid variant configuration for flag {0}: {1}")]
    InvalidVariantConfiguration(String, String),
    #[error("Hash key overrides could not be read")]
    ContinuityUnavailable,
}

impl FlagError {
    /// Returns (error_code, status_code) for this error.
    fn error_metadata(&self) -> (&'static str, u16) {
        match self {
            FlagError::ClientFacing(ClientFacingError::BadRequest(_)) => ("malformed_data", 400),
            FlagError::ClientFacing(ClientFacingError::Unauthorized(_)) => ("invalid_api_key", 401),
            FlagError::ClientFacing(ClientFacingError::RateLimited) => ("rate_limit_exceeded", 429),
            FlagError::ClientFacing(ClientFacingError::ServiceUnavailable) => {
                ("service_unavailable", 503)
            }

            FlagError::RequestDecodingError(_)
            | FlagError::RequestParsingError(_)
            | FlagError::MissingDistinctId => ("malformed_data", 400),

            FlagError::NoTokenError | FlagError::TokenValidationError => ("invalid_api_key", 401),

            FlagError::StoreError(e) if e.is_timeout() => ("timeout", 503),
            FlagError::StoreError(_) => ("service_unavailable", 503),

            FlagError::Internal(_) => ("internal_error", 500),
            FlagError::UnsupportedCohort(_) => ("unsupported_cohort", 500),
            FlagError::CohortNotFound(_) => ("cohort_not_found", 500),
            FlagError::CohortFiltersParsingError => ("cohort_filters_parsing_error", 500),
            FlagError::CohortDependencyCycle(_) => ("cohort_dependency_cycle", 500),
            FlagError::UnsupportedOperator(_) => ("unsupported_operator", 500),
            FlagError::InvalidVariantConfiguration(_, _) => ("invalid_variant_configuration", 500),
            FlagError::ContinuityUnavailable => ("continuity_unavailable", 503),
        }
    }

    /// Short error code, used as a metrics label and in logs.
    pub fn error_code(&self) -> &'static str {
        self.error_metadata().0
    }

    pub fn status_code(&self) -> u16 {
        self.error_metadata().1
    }
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let (code, status) = self.error_metadata();
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match status {
            StatusCode::TOO_MANY_REQUESTS => ErrorResponse::new(
                "validation_error",
                code,
                "Rate limit exceeded".to_string(),
            ),
            StatusCode::BAD_REQUEST => ErrorResponse::new(
                "validation_error",
                code,
                format!("Malformed request data: {self}"),
            ),
            StatusCode::UNAUTHORIZED => ErrorResponse::new(
                "authentication_error",
                code,
                "Project API key invalid. You can find your project API key in your project settings."
                    .to_string(),
            ),
            _ => {
                tracing::error!(error = %self, code, "request failed");
                ErrorResponse::new(
                    "server_error",
                    code,
                    "The service is temporarily unavailable. Please try again later.".to_string(),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseTarget;
    use axum::body::to_bytes;
    use serde_json::{json, Value};

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let response = FlagError::ClientFacing(ClientFacingError::RateLimited).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body_json(response).await,
            json!({
                "type": "validation_error",
                "code": "rate_limit_exceeded",
                "detail": "Rate limit exceeded",
                "attr": null
            })
        );
    }

    #[tokio::test]
    async fn test_malformed_request_response() {
        let response = FlagError::MissingDistinctId.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["type"], "validation_error");
        assert_eq!(body["code"], "malformed_data");
    }

    #[tokio::test]
    async fn test_invalid_token_response() {
        let response = FlagError::TokenValidationError.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["type"], "authentication_error");
        assert_eq!(body["code"], "invalid_api_key");
    }

    #[test]
    fn test_store_errors_are_service_unavailable() {
        let timeout = FlagError::StoreError(StoreError::Timeout(DatabaseTarget::Replica));
        let down = FlagError::StoreError(StoreError::Unavailable(DatabaseTarget::Primary));
        assert_eq!(timeout.error_code(), "timeout");
        assert_eq!(timeout.status_code(), 503);
        assert_eq!(down.error_code(), "service_unavailable");
    }

    #[test]
    fn test_per_flag_error_codes() {
        assert_eq!(
            FlagError::UnsupportedCohort(3).error_code(),
            "unsupported_cohort"
        );
        assert_eq!(
            FlagError::InvalidVariantConfiguration("f".to_string(), "sum".to_string())
                .error_code(),
            "invalid_variant_configuration"
        );
    }
}
