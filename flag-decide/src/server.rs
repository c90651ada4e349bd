use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;

use crate::api::flags_rate_limiter::FlagsRateLimiter;
use crate::config::Config;
use crate::database::DatabasePools;
use crate::db_monitor::DatabasePoolMonitor;
use crate::redis::RedisClient;
use crate::router;

const POOL_MONITOR_PERIOD: Duration = Duration::from_secs(30);

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let redis_client = RedisClient::new(config.redis_url.clone(), config.redis_timeout())
        .with_context(|| format!("failed to create redis client for {}", config.redis_url))?;

    let database_pools = DatabasePools::from_config(&config)
        .await
        .context("failed to create database pools")?;

    let rate_limiter = FlagsRateLimiter::new(
        *config.flags_rate_limit_enabled,
        *config.flags_rate_limit_log_only,
        config.flags_bucket_replenish_rate,
        config.flags_bucket_capacity,
    )
    .context(
        "invalid token rate limit configuration, check FLAGS_BUCKET_REPLENISH_RATE \
         and FLAGS_BUCKET_CAPACITY (both must be > 0)",
    )?;

    let db_monitor = DatabasePoolMonitor::new(database_pools.clone(), POOL_MONITOR_PERIOD);
    tokio::spawn(async move {
        db_monitor.start_monitoring().await;
    });

    let state = router::State::new(
        Arc::new(database_pools),
        Arc::new(redis_client),
        rate_limiter,
        &config,
    );
    let app = router::router(state, &config);

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")
}
