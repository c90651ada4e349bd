use std::future::ready;
use std::sync::Arc;

use axum::{
    http::{Method, StatusCode},
    routing::{any, get},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::api::{endpoint, flags_rate_limiter::FlagsRateLimiter};
use crate::config::Config;
use crate::database::{ReadinessCheck, ReadinessHandle};
use crate::flags::flag_store::{DefinitionStore, FlagDefinitionCache};
use crate::metrics::utils::setup_metrics_routes;
use crate::persons::person_operations::{PersonStore, PersonStoreHandle};
use crate::redis::RedisClientHandle;
use crate::team::team_operations::{TeamStore, TeamTokenCache};

#[derive(Clone)]
pub struct State {
    pub teams: TeamTokenCache,
    pub flag_definitions: FlagDefinitionCache,
    pub persons: PersonStoreHandle,
    pub rate_limiter: FlagsRateLimiter,
    pub readiness: ReadinessHandle,
}

impl State {
    /// Wires every collaborator to one backing store, fronted by the redis caches.
    pub fn new<S>(
        store: Arc<S>,
        redis: RedisClientHandle,
        rate_limiter: FlagsRateLimiter,
        config: &Config,
    ) -> Self
    where
        S: TeamStore + DefinitionStore + PersonStore + ReadinessCheck + Send + Sync + 'static,
    {
        State {
            teams: TeamTokenCache::new(store.clone(), redis.clone(), config.cache_ttl()),
            flag_definitions: FlagDefinitionCache::new(store.clone(), redis, config.cache_ttl()),
            persons: store.clone(),
            rate_limiter,
            readiness: store,
        }
    }
}

pub fn router(state: State, config: &Config) -> Router {
    let readiness_check = state.readiness.clone();

    // Very permissive CORS policy, as old SDK versions
    // and reverse proxies might send funky headers.
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS, Method::HEAD])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let status_router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || readiness(readiness_check.clone())),
        )
        .route("/_liveness", get(|| ready("ok")));

    let flags_router = Router::new()
        .route("/flags", any(endpoint::flags))
        .route("/flags/", any(endpoint::flags))
        .route("/decide", any(endpoint::flags))
        .route("/decide/", any(endpoint::flags))
        .layer(ConcurrencyLimitLayer::new(config.max_concurrency));

    let router = Router::new()
        .merge(status_router)
        .merge(flags_router)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    // Don't install metrics unless asked to
    // Global metrics recorders can play poorly with e.g. tests
    if *config.enable_metrics {
        setup_metrics_routes(router)
    } else {
        router
    }
}

pub async fn readiness(check: ReadinessHandle) -> Result<&'static str, (StatusCode, String)> {
    check.check_ready().await.map_err(|e| {
        tracing::warn!("readiness check failed: {}", e);
        (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })?;
    Ok("ready")
}

pub async fn index() -> &'static str {
    "flag-decide"
}
