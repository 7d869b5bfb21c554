//! Stateless condition operators and the value coercions they rely on.
//!
//! Operators answer `false` when either side has the wrong type; only
//! structurally invalid conditions (unknown operator, unknown common field,
//! non-string `bucket_set` value) are errors, and those are raised by the
//! dispatcher in `eval.rs`.
use chrono::{DateTime, Datelike, Utc};
use serde_json::Value;

pub(crate) fn eval_number_match(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "gt" => compare_numbers(left, right, |x, y| x > y),
        "gte" => compare_numbers(left, right, |x, y| x >= y),
        "lt" => compare_numbers(left, right, |x, y| x < y),
        "lte" => compare_numbers(left, right, |x, y| x <= y),
        _ => false,
    }
}

pub(crate) fn eval_basic_match(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "is_null" => left.is_null(),
        "is_not_null" => !left.is_null(),
        "is_true" => left.as_bool() == Some(true),
        "is_false" => left.as_bool() == Some(false),
        "eq" => deep_equal(left, right),
        "neq" => !deep_equal(left, right),
        _ => false,
    }
}

pub(crate) fn eval_version_match(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "version_gt" => compare_versions(left, right, |ord| ord.is_gt()),
        "version_gte" => compare_versions(left, right, |ord| ord.is_ge()),
        "version_lt" => compare_versions(left, right, |ord| ord.is_lt()),
        "version_lte" => compare_versions(left, right, |ord| ord.is_le()),
        "version_eq" => compare_versions(left, right, |ord| ord.is_eq()),
        "version_neq" => compare_versions(left, right, |ord| ord.is_ne()),
        _ => false,
    }
}

pub(crate) fn eval_array_match(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "any_of_case_insensitive" => array_any(left, right, |x, y| compare_strings(x, y, true)),
        "none_of_case_insensitive" => !array_any(left, right, |x, y| compare_strings(x, y, true)),
        "any_of_case_sensitive" => array_any(left, right, |x, y| compare_strings(x, y, false)),
        "none_of_case_sensitive" => !array_any(left, right, |x, y| compare_strings(x, y, false)),
        _ => false,
    }
}

pub(crate) fn eval_time_match(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "before" => parse_time(left) < parse_time(right),
        "after" => parse_time(left) > parse_time(right),
        _ => false,
    }
}

fn compare_numbers(left: &Value, right: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (numeric_value(left), numeric_value(right)) {
        (Some(l), Some(r)) => cmp(l, r),
        _ => false,
    }
}

/// Coerce a value to f64: numbers directly, strings via decimal parse.
fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn compare_versions(
    left: &Value,
    right: &Value,
    cmp: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let (Some(l), Some(r)) = (left.as_str(), right.as_str()) else {
        return false;
    };
    // strip a pre-release style suffix: "1.2.3-beta" compares as "1.2.3"
    let l = l.split('-').next().unwrap_or_default();
    let r = r.split('-').next().unwrap_or_default();
    if l.is_empty() || r.is_empty() {
        return false;
    }
    match (split_version(l), split_version(r)) {
        (Some(l), Some(r)) => cmp(compare_version_parts(&l, &r)),
        _ => false,
    }
}

fn split_version(version: &str) -> Option<Vec<i64>> {
    version.split('.').map(|part| part.parse().ok()).collect()
}

/// Component-wise comparison with missing trailing segments treated as 0.
fn compare_version_parts(left: &[i64], right: &[i64]) -> std::cmp::Ordering {
    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            std::cmp::Ordering::Equal => continue,
            ord => return ord,
        }
    }
    std::cmp::Ordering::Equal
}

fn array_any(left: &Value, right: &Value, matches: impl Fn(&Value, &Value) -> bool) -> bool {
    match right {
        Value::Array(candidates) => candidates.iter().any(|candidate| matches(left, candidate)),
        _ => false,
    }
}

fn compare_strings(left: &Value, right: &Value, ignore_case: bool) -> bool {
    if left.is_null() || right.is_null() {
        return false;
    }
    let l = value_to_string(left);
    let r = value_to_string(right);
    if ignore_case {
        l.to_lowercase() == r.to_lowercase()
    } else {
        l == r
    }
}

/// Stringify a value for membership comparison and subject resolution.
/// Null renders empty, numbers in shortest decimal form, lists joined by
/// commas.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().unwrap_or_default().to_string()
            }
        }
        Value::Array(values) => values
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => value.to_string(),
    }
}

/// Structural equality with two carve-outs: a null right side also accepts
/// an empty-string left, and two numbers compare by value so `5` equals
/// `5.0`.
pub(crate) fn deep_equal(left: &Value, right: &Value) -> bool {
    if right.is_null() {
        return left.is_null() || left.as_str() == Some("");
    }
    if let (Value::Number(l), Value::Number(r)) = (left, right) {
        return l.as_f64() == r.as_f64();
    }
    left == right
}

/// Parse a timestamp: RFC 3339 strings, or integer epochs interpreted as
/// seconds unless the resulting year exceeds current+100, then as
/// milliseconds. Invalid input yields the minimum instant.
pub(crate) fn parse_time(value: &Value) -> DateTime<Utc> {
    match value {
        Value::Number(n) => epoch_time(n.as_f64().unwrap_or_default() as i64),
        Value::String(s) => {
            if let Ok(t) = DateTime::parse_from_rfc3339(s) {
                return t.with_timezone(&Utc);
            }
            match s.parse::<i64>() {
                Ok(n) => epoch_time(n),
                Err(_) => DateTime::<Utc>::MIN_UTC,
            }
        }
        _ => DateTime::<Utc>::MIN_UTC,
    }
}

fn epoch_time(n: i64) -> DateTime<Utc> {
    let seconds = DateTime::from_timestamp(n, 0).unwrap_or(DateTime::<Utc>::MIN_UTC);
    if seconds.year() > Utc::now().year() + 100 {
        return DateTime::from_timestamp(n / 1000, 0).unwrap_or(DateTime::<Utc>::MIN_UTC);
    }
    seconds
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn numeric_coerces_numbers_and_strings() {
        assert!(eval_number_match("gt", &json!(19), &json!(18)));
        assert!(!eval_number_match("gt", &json!(18), &json!(18)));
        assert!(eval_number_match("gte", &json!(18), &json!(18)));
        assert!(eval_number_match("lt", &json!(17.5), &json!(18)));
        assert!(eval_number_match("lte", &json!("18"), &json!(18)));
        assert!(eval_number_match("gt", &json!("19.5"), &json!("18")));
    }

    #[test]
    fn numeric_fails_on_uncoercible() {
        assert!(!eval_number_match("gt", &Value::Null, &json!(18)));
        assert!(!eval_number_match("gt", &json!("abc"), &json!(18)));
        assert!(!eval_number_match("gt", &json!(true), &json!(18)));
        assert!(!eval_number_match("unknown", &json!(19), &json!(18)));
    }

    #[test]
    fn version_compares_component_wise() {
        assert!(eval_version_match("version_gt", &json!("10.1"), &json!("10.0")));
        assert!(eval_version_match("version_gt", &json!("10.0.1"), &json!("10.0")));
        assert!(!eval_version_match("version_gt", &json!("10.0"), &json!("10.0")));
        assert!(!eval_version_match("version_gt", &json!("1.2"), &json!("1.10")));
        assert!(eval_version_match("version_gte", &json!("10.0"), &json!("10.0")));
        assert!(eval_version_match("version_lt", &json!("9.9"), &json!("10.0")));
        assert!(eval_version_match("version_lte", &json!("10.0"), &json!("10.0")));
        // missing trailing segments count as zero
        assert!(eval_version_match("version_eq", &json!("10.0.0"), &json!("10.0")));
        assert!(eval_version_match("version_neq", &json!("10.1"), &json!("10.0")));
    }

    #[test]
    fn version_strips_suffix_and_rejects_garbage() {
        assert!(eval_version_match("version_eq", &json!("1.2.3-beta"), &json!("1.2.3")));
        assert!(!eval_version_match("version_eq", &json!("abc"), &json!("1.0")));
        assert!(!eval_version_match("version_eq", &json!(10), &json!("10")));
        assert!(!eval_version_match("version_eq", &Value::Null, &json!("1.0")));
        // unknown version_* suffix is false, not an error
        assert!(!eval_version_match("version_unknown", &json!("1.0"), &json!("1.0")));
    }

    #[test]
    fn membership_stringifies_and_respects_case() {
        let list = json!(["Chrome", "Safari"]);
        assert!(eval_array_match("any_of_case_sensitive", &json!("Chrome"), &list));
        assert!(!eval_array_match("any_of_case_sensitive", &json!("chrome"), &list));
        assert!(eval_array_match("any_of_case_insensitive", &json!("chrome"), &list));
        assert!(!eval_array_match("none_of_case_sensitive", &json!("Chrome"), &list));
        assert!(eval_array_match("none_of_case_sensitive", &json!("chrome"), &list));
        assert!(!eval_array_match("none_of_case_insensitive", &json!("chrome"), &list));

        // numbers compare against their string form
        assert!(eval_array_match("any_of_case_sensitive", &json!(42), &json!(["42"])));
        assert!(eval_array_match("any_of_case_sensitive", &json!(true), &json!(["true"])));
    }

    #[test]
    fn membership_null_and_non_list() {
        let list = json!(["a"]);
        assert!(!eval_array_match("any_of_case_sensitive", &Value::Null, &list));
        // a missing left side makes none_of pass
        assert!(eval_array_match("none_of_case_sensitive", &Value::Null, &list));
        assert!(!eval_array_match("any_of_case_sensitive", &json!("a"), &json!("a")));
    }

    #[test]
    fn null_and_bool_checks() {
        assert!(eval_basic_match("is_null", &Value::Null, &Value::Null));
        assert!(!eval_basic_match("is_null", &json!(""), &Value::Null));
        assert!(eval_basic_match("is_not_null", &json!(""), &Value::Null));
        assert!(eval_basic_match("is_true", &json!(true), &Value::Null));
        assert!(!eval_basic_match("is_true", &json!(1), &Value::Null));
        assert!(eval_basic_match("is_false", &json!(false), &Value::Null));
        assert!(!eval_basic_match("is_false", &json!(0), &Value::Null));
    }

    #[test]
    fn deep_equality_carve_outs() {
        assert!(eval_basic_match("eq", &json!("US"), &json!("US")));
        assert!(!eval_basic_match("eq", &json!("us"), &json!("US")));
        assert!(eval_basic_match("eq", &json!(5), &json!(5.0)));
        assert!(eval_basic_match("eq", &json!({"a": [1]}), &json!({"a": [1]})));
        // null right accepts null or empty-string left
        assert!(eval_basic_match("eq", &Value::Null, &Value::Null));
        assert!(eval_basic_match("eq", &json!(""), &Value::Null));
        assert!(!eval_basic_match("eq", &json!("x"), &Value::Null));
        // numeric strings do not coerce for eq, unlike gte
        assert!(!eval_basic_match("eq", &json!("5"), &json!(5)));

        assert!(eval_basic_match("neq", &Value::Null, &json!(0)));
        assert!(!eval_basic_match("neq", &json!(0), &json!(0)));
    }

    #[test]
    fn time_parses_rfc3339_and_epochs() {
        let reference = json!("2024-01-01T00:00:00Z");
        assert!(eval_time_match("before", &json!("2023-06-01T00:00:00Z"), &reference));
        assert!(!eval_time_match("before", &reference, &reference));
        assert!(eval_time_match("after", &json!("2024-06-01T00:00:00Z"), &reference));

        // 2024-01-01 as epoch seconds and milliseconds mean the same instant
        assert_eq!(parse_time(&json!(1_704_067_200)), parse_time(&json!(1_704_067_200_000i64)));
        assert_eq!(parse_time(&json!("1704067200")), parse_time(&reference));
    }

    #[test]
    fn invalid_time_is_minimum_instant() {
        assert_eq!(parse_time(&json!("not-a-time")), DateTime::<Utc>::MIN_UTC);
        assert_eq!(parse_time(&json!(true)), DateTime::<Utc>::MIN_UTC);
        // the zero instant sorts before any real timestamp
        assert!(eval_time_match("before", &json!("garbage"), &json!("2024-01-01T00:00:00Z")));
    }

    #[test]
    fn stringification_forms() {
        assert_eq!(value_to_string(&Value::Null), "");
        assert_eq!(value_to_string(&json!("s")), "s");
        assert_eq!(value_to_string(&json!(42)), "42");
        assert_eq!(value_to_string(&json!(1.5)), "1.5");
        assert_eq!(value_to_string(&json!(false)), "false");
        assert_eq!(value_to_string(&json!(["a", 1])), "a,1");
    }
}
