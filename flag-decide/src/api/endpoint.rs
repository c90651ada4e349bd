use axum::extract::{MatchedPath, Query, State};
use axum::http::{HeaderMap, Method};
use axum::{debug_handler, Json};
use bytes::Bytes;
use tracing::Instrument;
use uuid::Uuid;

use crate::api::errors::FlagError;
use crate::api::request_handler::{process_request, FlagsQueryParams, RequestContext};
use crate::api::types::FlagsResponse;
use crate::router;

/// Feature flag evaluation endpoint, mounted under both `/flags` and `/decide`.
#[debug_handler]
pub async fn flags(
    state: State<router::State>,
    Query(query_params): Query<FlagsQueryParams>,
    headers: HeaderMap,
    method: Method,
    path: MatchedPath,
    body: Bytes,
) -> Result<Json<FlagsResponse>, FlagError> {
    let request_id = Uuid::now_v7();
    let span = request_span(&headers, &query_params, &method, &path, request_id);

    tracing::info!(
        parent: &span,
        method = %method,
        path = %path.as_str().trim_end_matches('/'),
        "processing request"
    );

    let context = RequestContext {
        state: state.0,
        headers,
        meta: query_params,
        body,
    };

    let response = process_request(context).instrument(span).await?;
    Ok(Json(response))
}

fn request_span(
    headers: &HeaderMap,
    query_params: &FlagsQueryParams,
    method: &Method,
    path: &MatchedPath,
    request_id: Uuid,
) -> tracing::Span {
    let user_agent = headers
        .get("user-agent")
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));
    let content_type = headers
        .get("content-type")
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));

    tracing::info_span!(
        "request",
        user_agent = %user_agent,
        content_type = %content_type,
        version = %query_params.version.as_deref().unwrap_or("unknown"),
        lib_version = %query_params.lib_version.as_deref().unwrap_or("unknown"),
        compression = %query_params.compression.as_ref().map_or("none", |c| c.as_str()),
        method = %method.as_str(),
        path = %path.as_str().trim_end_matches('/'),
        request_id = %request_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::request_handler::Compression;
    use axum::{
        body::Body,
        extract::{FromRequest, Request},
        http::Uri,
    };

    async fn params(uri: &'static str) -> FlagsQueryParams {
        let req = Request::builder()
            .uri(Uri::from_static(uri))
            .body(Body::empty())
            .unwrap();
        let Query(params) = Query::<FlagsQueryParams>::from_request(req, &())
            .await
            .unwrap();
        params
    }

    #[tokio::test]
    async fn test_query_param_extraction() {
        let full =
            params("http://localhost:3001/decide/?v=3&compression=base64&ver=1.211.0&reasons=true")
                .await;
        assert_eq!(full.version, Some("3".to_string()));
        assert_eq!(full.lib_version, Some("1.211.0".to_string()));
        assert!(matches!(full.compression, Some(Compression::Base64)));
        assert!(full.include_reasons());

        let partial = params("http://localhost:3001/flags/?v=2&compression=gzip-js").await;
        assert_eq!(partial.version, Some("2".to_string()));
        assert!(matches!(partial.compression, Some(Compression::Gzip)));
        assert_eq!(partial.lib_version, None);
        assert!(!partial.include_reasons());

        let empty = params("http://localhost:3001/flags/").await;
        assert_eq!(empty.version, None);
        assert!(empty.compression.is_none());
    }

    #[tokio::test]
    async fn test_unknown_compression_is_kept_as_unsupported() {
        let query = params("http://localhost:3001/flags/?compression=zstd").await;
        assert!(matches!(query.compression, Some(Compression::Unsupported)));
    }
}
