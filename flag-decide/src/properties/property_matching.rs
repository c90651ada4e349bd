use std::collections::HashMap;

use chrono::{DateTime, Duration, Months, Utc};
use dateparser::parse as parse_date;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::api::errors::FlagError;
use crate::cohorts::cohort_operations::CohortOracle;
use crate::properties::property_models::{OperatorType, PropertyFilter};

#[derive(Debug, PartialEq, Eq)]
pub enum FlagMatchingError {
    ValidationError(String),
    UnsupportedOperator(String),
}

static RELATIVE_DATE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-?(?P<number>[0-9]+)(?P<interval>[hdwmy])$").expect("valid relative date regex")
});

pub fn to_string_representation(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn to_f64_representation(value: &Value) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    to_string_representation(value).parse::<f64>().ok()
}

/// Matches one property filter against a property bag.
///
/// A key missing from the bag never matches the positive operators (`exact`,
/// `icontains`, `regex`, comparisons, dates) and always matches the negated
/// ones (`is_not`, `not_icontains`, `not_regex`, `is_not_set`).
pub fn match_property(
    property: &PropertyFilter,
    matching_property_values: &HashMap<String, Value>,
) -> Result<bool, FlagMatchingError> {
    let key = &property.key;
    let operator = property.operator.unwrap_or(OperatorType::Exact);
    let match_value = matching_property_values.get(key);

    match operator {
        OperatorType::IsSet => return Ok(match_value.is_some()),
        OperatorType::IsNotSet => return Ok(match_value.is_none()),
        OperatorType::Unknown => return Err(FlagMatchingError::UnsupportedOperator(key.clone())),
        _ => {}
    }

    let Some(value) = &property.value else {
        return Ok(false);
    };

    match operator {
        OperatorType::Exact | OperatorType::IsNot => {
            let Some(match_value) = match_value else {
                return Ok(operator == OperatorType::IsNot);
            };
            let is_exact = compute_exact_match(value, match_value);
            Ok(if operator == OperatorType::Exact {
                is_exact
            } else {
                !is_exact
            })
        }
        OperatorType::Icontains | OperatorType::NotIcontains => {
            let Some(match_value) = match_value else {
                return Ok(operator == OperatorType::NotIcontains);
            };
            let is_contained = to_string_representation(match_value)
                .to_lowercase()
                .contains(&to_string_representation(value).to_lowercase());
            Ok(if operator == OperatorType::Icontains {
                is_contained
            } else {
                !is_contained
            })
        }
        OperatorType::Regex | OperatorType::NotRegex => {
            let Some(match_value) = match_value else {
                return Ok(operator == OperatorType::NotRegex);
            };
            // an invalid pattern matches nothing, in either direction
            let Ok(pattern) = Regex::new(&to_string_representation(value)) else {
                return Ok(false);
            };
            let found = pattern.is_match(&to_string_representation(match_value));
            Ok(if operator == OperatorType::Regex {
                found
            } else {
                !found
            })
        }
        OperatorType::Gt | OperatorType::Gte | OperatorType::Lt | OperatorType::Lte => {
            let Some(match_value) = match_value else {
                return Ok(false);
            };
            let Some(lhs) = to_f64_representation(match_value) else {
                tracing::debug!(
                    "Failed to parse property value '{}' for key '{}' as number",
                    match_value,
                    key
                );
                return Err(FlagMatchingError::ValidationError(
                    "value is not a number".to_string(),
                ));
            };
            let Some(rhs) = to_f64_representation(value) else {
                return Err(FlagMatchingError::ValidationError(
                    "filter value is not a number".to_string(),
                ));
            };
            Ok(match operator {
                OperatorType::Gt => lhs > rhs,
                OperatorType::Gte => lhs >= rhs,
                OperatorType::Lt => lhs < rhs,
                _ => lhs <= rhs,
            })
        }
        OperatorType::IsDateExact | OperatorType::IsDateAfter | OperatorType::IsDateBefore => {
            let Some(parsed_date) = determine_parsed_date_for_property_matching(match_value)
            else {
                return Ok(false);
            };
            let Some(filter_date) = value.as_str().and_then(parse_date_string) else {
                return Ok(false);
            };
            Ok(match operator {
                OperatorType::IsDateBefore => parsed_date < filter_date,
                OperatorType::IsDateAfter => parsed_date > filter_date,
                _ => parsed_date == filter_date,
            })
        }
        // cohort membership operators, resolved by the cohort oracle
        OperatorType::In | OperatorType::NotIn => Err(FlagMatchingError::ValidationError(
            "in/not_in only apply to cohort filters".to_string(),
        )),
        OperatorType::Unknown => Err(FlagMatchingError::UnsupportedOperator(key.clone())),
        OperatorType::IsSet | OperatorType::IsNotSet => Ok(false),
    }
}

/// Matches a person or group filter, honouring its `negation`.
///
/// An unknown operator fails the flag; other operator errors are a non-match.
pub fn match_property_filter(
    filter: &PropertyFilter,
    properties: &HashMap<String, Value>,
) -> Result<bool, FlagError> {
    match match_property(filter, properties) {
        Ok(matched) => Ok(matched != filter.is_negated()),
        Err(FlagMatchingError::UnsupportedOperator(key)) => {
            Err(FlagError::UnsupportedOperator(key))
        }
        Err(FlagMatchingError::ValidationError(_)) => Ok(false),
    }
}

/// True when every filter matches; operator errors count as a non-match.
pub fn all_properties_match(
    flag_condition_properties: &[PropertyFilter],
    matching_property_values: &HashMap<String, Value>,
) -> bool {
    flag_condition_properties.iter().all(|property| {
        match_property_filter(property, matching_property_values).unwrap_or(false)
    })
}

/// Matches a condition's filters: plain property filters first, then cohort membership.
///
/// Only cohort lookups can fail, and their failure belongs to the flag being evaluated.
pub fn match_filters(
    filters: &[PropertyFilter],
    properties: &HashMap<String, Value>,
    cohort_oracle: &dyn CohortOracle,
) -> Result<bool, FlagError> {
    if let Some(filter) = filters.iter().find(|f| f.has_unknown_operator()) {
        return Err(FlagError::UnsupportedOperator(filter.key.clone()));
    }

    let (cohort_filters, property_filters): (Vec<&PropertyFilter>, Vec<&PropertyFilter>) =
        filters.iter().partition(|f| f.is_cohort());

    for filter in property_filters {
        if !match_property_filter(filter, properties)? {
            return Ok(false);
        }
    }

    for filter in cohort_filters {
        let cohort_id = filter
            .get_cohort_id()
            .ok_or(FlagError::CohortFiltersParsingError)?;
        let is_member = cohort_oracle.is_member(cohort_id, properties)?;
        let matched = match filter.operator.unwrap_or(OperatorType::In) {
            OperatorType::NotIn => !is_member,
            _ => is_member,
        };
        if matched == filter.is_negated() {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compute_exact_match(value: &Value, property_value: &Value) -> bool {
    if is_truthy_or_falsy_property_value(value) {
        // "true", "True" and true are all the same thing here
        return is_truthy_property_value(value) == is_truthy_property_value(property_value);
    }

    if let Value::Array(candidates) = value {
        let needle = to_string_representation(property_value).to_lowercase();
        return candidates
            .iter()
            .any(|candidate| to_string_representation(candidate).to_lowercase() == needle);
    }

    to_string_representation(value).to_lowercase()
        == to_string_representation(property_value).to_lowercase()
}

fn is_truthy_or_falsy_property_value(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::String(s) => {
            let lowered = s.to_lowercase();
            lowered == "true" || lowered == "false"
        }
        Value::Array(values) => {
            !values.is_empty() && values.iter().all(is_truthy_or_falsy_property_value)
        }
        _ => false,
    }
}

fn is_truthy_property_value(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.to_lowercase() == "true",
        Value::Array(values) => values.iter().all(is_truthy_property_value),
        _ => false,
    }
}

fn parse_relative_date(date_str: &str) -> Option<DateTime<Utc>> {
    let captures = RELATIVE_DATE_PATTERN.captures(date_str.trim())?;
    let number: u32 = captures.name("number")?.as_str().parse().ok()?;
    // anything beyond ten thousand years is a typo
    if number >= 10_000 {
        return None;
    }
    let now = Utc::now();
    match captures.name("interval")?.as_str() {
        "h" => now.checked_sub_signed(Duration::hours(i64::from(number))),
        "d" => now.checked_sub_signed(Duration::days(i64::from(number))),
        "w" => now.checked_sub_signed(Duration::weeks(i64::from(number))),
        "m" => now.checked_sub_months(Months::new(number)),
        "y" => now.checked_sub_months(Months::new(number.checked_mul(12)?)),
        _ => None,
    }
}

fn parse_date_string(date_str: &str) -> Option<DateTime<Utc>> {
    if let Some(date) = parse_relative_date(date_str) {
        return Some(date);
    }
    parse_date(date_str).ok()
}

fn determine_parsed_date_for_property_matching(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(date_str) => {
            if let Ok(num) = date_str.parse::<f64>() {
                return parse_float_timestamp(num);
            }
            parse_date_string(date_str)
        }
        Value::Number(num) => parse_float_timestamp(num.as_f64()?),
        _ => None,
    }
}

fn parse_float_timestamp(value: f64) -> Option<DateTime<Utc>> {
    let whole_seconds = value.floor() as i64;
    let nanos = ((value % 1.0) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(whole_seconds, nanos)
}
