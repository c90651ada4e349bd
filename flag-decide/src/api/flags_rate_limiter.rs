//! Per-token admission control for flag requests.
//!
//! Each token gets its own in-memory token bucket: `capacity` requests of burst,
//! refilled at `replenish_rate` per second. Buckets are per process, not shared
//! across replicas.
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter,
};

use crate::metrics::consts::{FLAG_RATE_LIMIT_EXCEEDED_COUNTER, FLAG_RATE_LIMIT_LOG_ONLY_COUNTER};
use crate::metrics::utils::inc;

/// Bucket shared by every request that arrives without a token.
pub const MISSING_TOKEN_BUCKET_KEY: &str = "__missing_token__";

type KeyedLimiter<C> = RateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    C,
    NoOpMiddleware<<C as Clock>::Instant>,
>;

pub struct FlagsRateLimiter<C: Clock = DefaultClock> {
    enabled: bool,
    log_only: bool,
    limiter: Arc<KeyedLimiter<C>>,
}

impl<C: Clock> Clone for FlagsRateLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled,
            log_only: self.log_only,
            limiter: self.limiter.clone(),
        }
    }
}

impl<C: Clock> fmt::Debug for FlagsRateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagsRateLimiter")
            .field("enabled", &self.enabled)
            .field("log_only", &self.log_only)
            .finish_non_exhaustive()
    }
}

fn quota(replenish_rate: f64, capacity: u32) -> anyhow::Result<Quota> {
    let burst = NonZeroU32::new(capacity)
        .ok_or_else(|| anyhow::anyhow!("Bucket capacity must be greater than 0"))?;

    if !(replenish_rate.is_finite() && replenish_rate > 0.0) {
        return Err(anyhow::anyhow!("Replenish rate must be greater than 0"));
    }

    // one token every 1 / rate seconds, fractional rates included
    let period = Duration::from_secs_f64(1.0 / replenish_rate);
    let quota = Quota::with_period(period)
        .ok_or_else(|| anyhow::anyhow!("Replenish rate {replenish_rate} is too high"))?;

    Ok(quota.allow_burst(burst))
}

impl FlagsRateLimiter<DefaultClock> {
    pub fn new(
        enabled: bool,
        log_only: bool,
        replenish_rate: f64,
        capacity: u32,
    ) -> anyhow::Result<Self> {
        Self::with_clock(enabled, log_only, replenish_rate, capacity, &DefaultClock::default())
    }
}

impl<C: Clock> FlagsRateLimiter<C> {
    pub fn with_clock(
        enabled: bool,
        log_only: bool,
        replenish_rate: f64,
        capacity: u32,
        clock: &C,
    ) -> anyhow::Result<Self> {
        let limiter = RateLimiter::dashmap_with_clock(quota(replenish_rate, capacity)?, clock);
        Ok(Self {
            enabled,
            log_only,
            limiter: Arc::new(limiter),
        })
    }

    /// Takes one unit from the token's bucket. Missing or empty tokens share one bucket.
    ///
    /// In log-only mode a request that would be rejected is counted and let through.
    pub fn allow_request(&self, token: Option<&str>) -> bool {
        if !self.enabled {
            return true;
        }

        let key = token
            .filter(|token| !token.is_empty())
            .unwrap_or(MISSING_TOKEN_BUCKET_KEY);
        if self.limiter.check_key(&key.to_string()).is_ok() {
            return true;
        }

        let labels = [("token".to_string(), key.to_string())];
        if self.log_only {
            tracing::info!(token = key, "request would have been rate limited");
            inc(FLAG_RATE_LIMIT_LOG_ONLY_COUNTER, &labels, 1);
            return true;
        }

        inc(FLAG_RATE_LIMIT_EXCEEDED_COUNTER, &labels, 1);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;

    fn fake_limiter(
        replenish_rate: f64,
        capacity: u32,
    ) -> (FlagsRateLimiter<FakeRelativeClock>, FakeRelativeClock) {
        let clock = FakeRelativeClock::default();
        let limiter =
            FlagsRateLimiter::with_clock(true, false, replenish_rate, capacity, &clock).unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_rate_limiter_disabled() {
        let limiter = FlagsRateLimiter::new(false, false, 1.0, 1).unwrap();
        for _ in 0..100 {
            assert!(limiter.allow_request(Some("test_token")));
        }
    }

    #[test]
    fn test_capacity_then_one_per_period() {
        let (limiter, clock) = fake_limiter(0.1, 3);
        let token = Some("test_token");

        assert!(limiter.allow_request(token));
        assert!(limiter.allow_request(token));
        assert!(limiter.allow_request(token));
        assert!(!limiter.allow_request(token));

        clock.advance(Duration::from_secs(10));
        assert!(limiter.allow_request(token));
        assert!(!limiter.allow_request(token));
    }

    #[test]
    fn test_partial_period_does_not_refill() {
        let (limiter, clock) = fake_limiter(0.1, 1);
        let token = Some("test_token");

        assert!(limiter.allow_request(token));
        clock.advance(Duration::from_secs(9));
        assert!(!limiter.allow_request(token));
        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow_request(token));
    }

    #[test]
    fn test_per_token_isolation() {
        let (limiter, _clock) = fake_limiter(0.1, 1);

        assert!(limiter.allow_request(Some("token1")));
        assert!(!limiter.allow_request(Some("token1")));
        assert!(limiter.allow_request(Some("token2")));
        assert!(!limiter.allow_request(Some("token2")));
    }

    #[test]
    fn test_missing_and_empty_tokens_share_a_bucket() {
        let (limiter, _clock) = fake_limiter(0.1, 2);

        assert!(limiter.allow_request(None));
        assert!(limiter.allow_request(Some("")));
        assert!(!limiter.allow_request(None));
        assert!(limiter.allow_request(Some("real_token")));
    }

    #[test]
    fn test_log_only_never_rejects() {
        let clock = FakeRelativeClock::default();
        let limiter = FlagsRateLimiter::with_clock(true, true, 0.1, 1, &clock).unwrap();

        for _ in 0..10 {
            assert!(limiter.allow_request(Some("test_token")));
        }
    }

    #[test]
    fn test_whole_rates_refill_per_second() {
        let (limiter, clock) = fake_limiter(1.0, 1);
        let token = Some("test_token");

        assert!(limiter.allow_request(token));
        assert!(!limiter.allow_request(token));
        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow_request(token));
    }

    #[test]
    fn test_fractional_rates_are_not_rounded() {
        let (limiter, clock) = fake_limiter(1.5, 1);
        let token = Some("test_token");

        assert!(limiter.allow_request(token));
        clock.advance(Duration::from_millis(600));
        assert!(!limiter.allow_request(token));
        clock.advance(Duration::from_millis(100));
        assert!(limiter.allow_request(token));
    }

    #[test]
    fn test_invalid_configuration() {
        let zero_rate = FlagsRateLimiter::new(true, false, 0.0, 500).unwrap_err();
        assert!(zero_rate
            .to_string()
            .contains("Replenish rate must be greater than 0"));

        let zero_capacity = FlagsRateLimiter::new(true, false, 10.0, 0).unwrap_err();
        assert!(zero_capacity
            .to_string()
            .contains("Bucket capacity must be greater than 0"));

        let negative_rate = FlagsRateLimiter::new(true, false, -1.0, 10).unwrap_err();
        assert!(negative_rate
            .to_string()
            .contains("Replenish rate must be greater than 0"));
    }

    #[test]
    fn test_debug_omits_bucket_state() {
        let limiter = FlagsRateLimiter::new(true, false, 1.0, 1).unwrap();
        assert_eq!(
            format!("{limiter:?}"),
            "FlagsRateLimiter { enabled: true, log_only: false, .. }"
        );
    }
}
