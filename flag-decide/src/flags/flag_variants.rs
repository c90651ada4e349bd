use crate::api::errors::FlagError;
use crate::flags::flag_models::MultivariateFlagVariant;

/// Rejects variant sets that can't be bucketed: negative weights or weights summing past 100.
pub fn validate_variants(
    flag_key: &str,
    variants: &[MultivariateFlagVariant],
) -> Result<(), FlagError> {
    if let Some(variant) = variants.iter().find(|v| v.rollout_percentage < 0.0) {
        return Err(FlagError::InvalidVariantConfiguration(
            flag_key.to_string(),
            format!("variant '{}' has a negative rollout percentage", variant.key),
        ));
    }

    let total: f64 = variants.iter().map(|v| v.rollout_percentage).sum();
    // allow for float noise from weights like 33.33 + 33.33 + 33.34
    if total > 100.0 + 1e-9 {
        return Err(FlagError::InvalidVariantConfiguration(
            flag_key.to_string(),
            format!("variant rollout percentages sum to {total}"),
        ));
    }

    Ok(())
}

/// Picks the first variant, in declaration order, whose cumulative upper bound exceeds `hash`.
///
/// Returns `None` when `hash` lands past the sum of all percentages.
pub fn select_variant(hash: f64, variants: &[MultivariateFlagVariant]) -> Option<&str> {
    let mut cumulative_percentage = 0.0;

    for variant in variants {
        cumulative_percentage += variant.rollout_percentage / 100.0;
        if hash < cumulative_percentage {
            return Some(&variant.key);
        }
    }
    None
}
