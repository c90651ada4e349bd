use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use flag_decide::api::flags_rate_limiter::FlagsRateLimiter;
use flag_decide::config::Config;
use flag_decide::redis::MockRedisClient;
use flag_decide::router::{router, State};
use flag_decide::test_utils::InMemoryStore;

/// A server on an ephemeral port, backed by an in-memory store and redis.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub store: InMemoryStore,
    pub redis: MockRedisClient,
    shutdown: Arc<Notify>,
}

impl ServerHandle {
    pub async fn new() -> ServerHandle {
        Self::for_config(Config::default_test_config()).await
    }

    pub async fn for_config(config: Config) -> ServerHandle {
        let store = InMemoryStore::new();
        let redis = MockRedisClient::new();
        let rate_limiter = FlagsRateLimiter::new(
            *config.flags_rate_limit_enabled,
            *config.flags_rate_limit_log_only,
            config.flags_bucket_replenish_rate,
            config.flags_bucket_capacity,
        )
        .expect("invalid rate limit configuration");

        let state = State::new(
            Arc::new(store.clone()),
            Arc::new(redis.clone()),
            rate_limiter,
            &config,
        );
        let app = router(state, &config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { notify.notified().await })
                .await
        });

        ServerHandle {
            addr,
            store,
            redis,
            shutdown,
        }
    }

    pub async fn send_flags_request(&self, path: &str, body: &Value) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("http://{}{}", self.addr, path))
            .body(body.to_string())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .expect("failed to send request")
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(format!("http://{}{}", self.addr, path))
            .send()
            .await
            .expect("failed to send request")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
