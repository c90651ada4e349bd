use anyhow::Result;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::common::*;
use flag_decide::config::{Config, FlexBool};
use flag_decide::test_utils::{create_flag, random_string};

pub mod common;

fn rate_limited_config(capacity: u32, log_only: bool) -> Config {
    let mut config = Config::default_test_config();
    config.flags_rate_limit_enabled = FlexBool(true);
    config.flags_rate_limit_log_only = FlexBool(log_only);
    config.flags_bucket_capacity = capacity;
    config.flags_bucket_replenish_rate = 0.1;
    config
}

#[tokio::test]
async fn test_rate_limit_basic() -> Result<()> {
    let server = ServerHandle::for_config(rate_limited_config(3, false)).await;
    let team = server.store.insert_team(&random_string("phc_", 12));
    server.store.insert_flag(create_flag(team.id, "enabled", None));

    let payload = json!({"token": team.api_token, "distinct_id": "user123"});

    for i in 1..=3 {
        let response = server.send_flags_request("/flags", &payload).await;
        assert_eq!(response.status(), StatusCode::OK, "Request {i} should succeed");
    }

    let rate_limited = server.send_flags_request("/flags", &payload).await;
    assert_eq!(rate_limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        rate_limited.json::<Value>().await?,
        json!({
            "type": "validation_error",
            "code": "rate_limit_exceeded",
            "detail": "Rate limit exceeded",
            "attr": null
        })
    );

    Ok(())
}

#[tokio::test]
async fn test_rate_limit_is_per_token() -> Result<()> {
    let server = ServerHandle::for_config(rate_limited_config(1, false)).await;
    let first = server.store.insert_team(&random_string("phc_", 12));
    let second = server.store.insert_team(&random_string("phc_", 12));

    let first_payload = json!({"token": first.api_token, "distinct_id": "user"});
    let second_payload = json!({"token": second.api_token, "distinct_id": "user"});

    assert_eq!(
        server.send_flags_request("/flags", &first_payload).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        server.send_flags_request("/flags", &first_payload).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        server.send_flags_request("/flags", &second_payload).await.status(),
        StatusCode::OK
    );

    Ok(())
}

#[tokio::test]
async fn test_rate_limit_runs_before_token_validation() -> Result<()> {
    let server = ServerHandle::for_config(rate_limited_config(1, false)).await;

    // requests without a token share one bucket, and are limited before auth fails them
    let payload = json!({"distinct_id": "user"});
    assert_eq!(
        server.send_flags_request("/flags", &payload).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        server.send_flags_request("/flags", &payload).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(server.store.call_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_disabled_flags_are_not_rate_limited() -> Result<()> {
    let server = ServerHandle::for_config(rate_limited_config(1, false)).await;
    let payload = json!({"token": "phc_any", "distinct_id": "user", "disable_flags": true});

    for _ in 0..5 {
        assert_eq!(
            server.send_flags_request("/flags", &payload).await.status(),
            StatusCode::OK
        );
    }

    Ok(())
}

#[tokio::test]
async fn test_log_only_mode_never_rejects() -> Result<()> {
    let server = ServerHandle::for_config(rate_limited_config(1, true)).await;
    let team = server.store.insert_team(&random_string("phc_", 12));
    let payload = json!({"token": team.api_token, "distinct_id": "user"});

    for _ in 0..5 {
        assert_eq!(
            server.send_flags_request("/flags", &payload).await.status(),
            StatusCode::OK
        );
    }

    Ok(())
}
