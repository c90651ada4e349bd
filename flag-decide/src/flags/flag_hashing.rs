//! Deterministic bucketing of subjects into [0, 1).
//!
//! The hash of `"{flag_key}.{salt}{namespace}"` is SHA1; the first 15 hex digits of the
//! digest are read as an integer and divided by `0xfffffffffffffff`. Every stored
//! assignment depends on this exact scheme, so it must not change.

use sha1::{Digest, Sha1};

const LONG_SCALE: u64 = 0xfffffffffffffff;

/// Namespace for the boolean rollout draw.
pub const ROLLOUT_NAMESPACE: &str = "";
/// Namespace for the variant draw, so it is independent of the rollout draw.
pub const VARIANT_NAMESPACE: &str = "variant";

/// Hashes `"{prefix}{hashed_identifier}{salt}"` to a uniform value in [0, 1).
pub fn calculate_hash(prefix: &str, hashed_identifier: &str, salt: &str) -> f64 {
    let hash_key = format!("{prefix}{hashed_identifier}{salt}");
    let digest = Sha1::digest(hash_key.as_bytes());

    let mut leading = [0u8; 8];
    leading.copy_from_slice(&digest[..8]);
    // 64 bits shifted down by 4 is the first 15 hex digits
    let hash_val = u64::from_be_bytes(leading) >> 4;
    hash_val as f64 / LONG_SCALE as f64
}

/// The value a subject (`salt`) draws for a flag in the given namespace.
pub fn flag_hash(flag_key: &str, salt: &str, namespace: &str) -> f64 {
    calculate_hash(&format!("{flag_key}."), salt, namespace)
}

/// True when the subject falls inside the rollout. `None` is fully rolled out.
pub fn is_in_rollout(flag_key: &str, salt: &str, rollout_percentage: Option<f64>) -> bool {
    match rollout_percentage {
        None => true,
        Some(pct) if pct >= 100.0 => true,
        Some(pct) => flag_hash(flag_key, salt, ROLLOUT_NAMESPACE) < pct / 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("12312", "", 0.4525525406521796; "numeric key")]
    #[test_case("32132", "", 0.5467118336624435; "another numeric key")]
    #[test_case("PostHog", "", 0.8015364780087316; "text key")]
    #[test_case("holdout-", "some_distinct_id", 0.7270002403585725; "prefixed id")]
    #[test_case("holdout-", "example_id", 0.9402003475831224; "prefixed example id")]
    fn test_calculate_hash(prefix: &str, hashed_identifier: &str, expected_hash: f64) {
        let hash = calculate_hash(prefix, hashed_identifier, "");
        assert!(
            (hash - expected_hash).abs() < f64::EPSILON,
            "expected {expected_hash}, got {hash}"
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let first = flag_hash("beta-feature", "example_id", VARIANT_NAMESPACE);
        for _ in 0..100 {
            assert_eq!(flag_hash("beta-feature", "example_id", VARIANT_NAMESPACE), first);
        }
    }

    #[test]
    fn test_hash_is_in_unit_interval() {
        for i in 0..1000 {
            let hash = flag_hash("some-flag", &format!("user_{i}"), ROLLOUT_NAMESPACE);
            assert!((0.0..1.0).contains(&hash));
        }
    }

    #[test]
    fn test_rollout_and_variant_draws_differ() {
        let differing = (0..100)
            .filter(|i| {
                let salt = format!("user_{i}");
                flag_hash("flag", &salt, ROLLOUT_NAMESPACE)
                    != flag_hash("flag", &salt, VARIANT_NAMESPACE)
            })
            .count();
        assert_eq!(differing, 100);
    }

    #[test]
    fn test_rollout_is_monotonic() {
        for i in 0..500 {
            let salt = format!("distinct_{i}");
            let mut was_in = false;
            for pct in 0..=100 {
                let is_in = is_in_rollout("monotonic-flag", &salt, Some(pct as f64));
                assert!(!(was_in && !is_in), "{salt} dropped out at {pct}%");
                was_in = is_in;
            }
            assert!(was_in);
        }
    }

    #[test]
    fn test_rollout_bounds() {
        assert!(is_in_rollout("flag", "anyone", None));
        assert!(is_in_rollout("flag", "anyone", Some(100.0)));
        assert!(!is_in_rollout("flag", "anyone", Some(0.0)));
    }

    #[test]
    fn test_rollout_fixtures() {
        assert!(!is_in_rollout(
            "experience-flag-test",
            "false_eval_user",
            Some(50.0)
        ));
        assert!(is_in_rollout(
            "experience-flag-test",
            "true_eval_user",
            Some(50.0)
        ));
    }
}
