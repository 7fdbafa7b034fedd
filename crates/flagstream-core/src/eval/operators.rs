//! Clause operator semantics.

use regex::Regex;
use semver::Version;
use serde_json::Value;

use crate::model::{parse_date, parse_semver, Op, PrepValue};

/// Apply one operator to one (context value, clause value) pair.
///
/// `prep` is the precomputed form of `clause_value`, when the clause came
/// through the codec. The unprepared fallback parses on the fly so that
/// hand-built flags behave identically, just slower.
pub(crate) fn apply(op: Op, context_value: &Value, clause_value: &Value, prep: Option<&PrepValue>) -> bool {
    match op {
        Op::In => values_equal(context_value, clause_value),
        Op::StartsWith => with_strs(context_value, clause_value, |a, b| a.starts_with(b)),
        Op::EndsWith => with_strs(context_value, clause_value, |a, b| a.ends_with(b)),
        Op::Contains => with_strs(context_value, clause_value, |a, b| a.contains(b)),
        Op::Matches => match_regex(context_value, clause_value, prep),
        Op::LessThan => with_numbers(context_value, clause_value, |a, b| a < b),
        Op::LessThanOrEqual => with_numbers(context_value, clause_value, |a, b| a <= b),
        Op::GreaterThan => with_numbers(context_value, clause_value, |a, b| a > b),
        Op::GreaterThanOrEqual => with_numbers(context_value, clause_value, |a, b| a >= b),
        Op::Before => with_dates(context_value, clause_value, prep, |a, b| a < b),
        Op::After => with_dates(context_value, clause_value, prep, |a, b| a > b),
        Op::SemVerEqual => with_versions(context_value, clause_value, prep, |o| o.is_eq()),
        Op::SemVerLessThan => with_versions(context_value, clause_value, prep, |o| o.is_lt()),
        Op::SemVerGreaterThan => with_versions(context_value, clause_value, prep, |o| o.is_gt()),
        // segmentMatch is resolved by the evaluator against the dataset, and
        // unrecognized operators never match.
        Op::SegmentMatch | Op::Unknown => false,
    }
}

/// Equality as flag data means it: numbers compare numerically regardless of
/// integer/float representation, everything else structurally.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn with_strs(a: &Value, b: &Value, f: impl FnOnce(&str, &str) -> bool) -> bool {
    match (a.as_str(), b.as_str()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

fn with_numbers(a: &Value, b: &Value, f: impl FnOnce(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

fn match_regex(context_value: &Value, clause_value: &Value, prep: Option<&PrepValue>) -> bool {
    let Some(haystack) = context_value.as_str() else {
        return false;
    };
    match prep {
        Some(PrepValue::Regex(regex)) => regex.is_match(haystack),
        // An unprepared clause value that fails to compile never matches.
        _ => clause_value
            .as_str()
            .and_then(|pattern| Regex::new(pattern).ok())
            .is_some_and(|regex| regex.is_match(haystack)),
    }
}

fn with_dates(
    context_value: &Value,
    clause_value: &Value,
    prep: Option<&PrepValue>,
    f: impl FnOnce(i64, i64) -> bool,
) -> bool {
    let Some(lhs) = parse_date(context_value) else {
        return false;
    };
    let rhs = match prep {
        Some(PrepValue::Date(ms)) => Some(*ms),
        _ => parse_date(clause_value),
    };
    rhs.is_some_and(|rhs| f(lhs, rhs))
}

fn with_versions(
    context_value: &Value,
    clause_value: &Value,
    prep: Option<&PrepValue>,
    f: impl FnOnce(std::cmp::Ordering) -> bool,
) -> bool {
    let Some(lhs) = context_value.as_str().and_then(parse_semver) else {
        return false;
    };
    let rhs: Option<Version> = match prep {
        Some(PrepValue::SemVer(v)) => Some(v.clone()),
        _ => clause_value.as_str().and_then(parse_semver),
    };
    // Precedence comparison: build metadata is ignored, prerelease is not.
    rhs.is_some_and(|rhs| f(lhs.cmp_precedence(&rhs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(Op::In, json!("a"), json!("a"), true)]
    #[test_case(Op::In, json!("a"), json!("b"), false)]
    #[test_case(Op::In, json!(99), json!(99.0), true; "numeric equality crosses int and float")]
    #[test_case(Op::In, json!(true), json!(true), true)]
    #[test_case(Op::In, json!({"a": 1}), json!({"a": 1}), true)]
    #[test_case(Op::StartsWith, json!("flagstream"), json!("flag"), true)]
    #[test_case(Op::StartsWith, json!(123), json!("1"), false; "startsWith on non-string")]
    #[test_case(Op::EndsWith, json!("flagstream"), json!("stream"), true)]
    #[test_case(Op::Contains, json!("flagstream"), json!("gst"), true)]
    #[test_case(Op::Matches, json!("hello-42"), json!(r"\d+"), true; "regex matches anywhere")]
    #[test_case(Op::Matches, json!(42), json!(r"\d+"), false; "regex on non-string never matches")]
    #[test_case(Op::Matches, json!("x"), json!("("), false; "invalid pattern never matches")]
    #[test_case(Op::LessThan, json!(1), json!(2), true)]
    #[test_case(Op::LessThan, json!(2), json!(2), false)]
    #[test_case(Op::LessThanOrEqual, json!(2), json!(2), true)]
    #[test_case(Op::GreaterThan, json!(2.5), json!(2), true)]
    #[test_case(Op::GreaterThanOrEqual, json!("2"), json!(2), false; "numeric op on string")]
    #[test_case(Op::Unknown, json!("x"), json!("x"), false)]
    fn operator_table(op: Op, context_value: Value, clause_value: Value, expected: bool) {
        assert_eq!(apply(op, &context_value, &clause_value, None), expected);
    }

    #[test]
    fn dates_compare_as_absolute_instants() {
        let earlier = json!("2024-01-15T05:00:00-05:00");
        let later = json!("2024-01-15T11:00:00+00:00");
        assert!(apply(Op::Before, &earlier, &later, None));
        assert!(apply(Op::After, &later, &earlier, None));
        // Equal instants in different zones are neither before nor after.
        let same_instant = json!("2024-01-15T10:00:00+00:00");
        let same_in_est = json!("2024-01-15T05:00:00-05:00");
        assert!(!apply(Op::Before, &same_instant, &same_in_est, None));
        assert!(!apply(Op::After, &same_instant, &same_in_est, None));
    }

    #[test]
    fn dates_accept_epoch_millis() {
        assert!(apply(Op::Before, &json!(1000), &json!(2000), None));
        assert!(!apply(Op::Before, &json!("not a date"), &json!(2000), None));
    }

    #[test]
    fn semver_build_metadata_ignored_prerelease_not() {
        assert!(apply(Op::SemVerEqual, &json!("1.2.3"), &json!("1.2.3+build"), None));
        assert!(!apply(Op::SemVerEqual, &json!("1.2.3"), &json!("1.2.3-pre"), None));
        assert!(apply(Op::SemVerLessThan, &json!("1.2.3-pre"), &json!("1.2.3"), None));
        assert!(apply(Op::SemVerGreaterThan, &json!("2"), &json!("1.9.9"), None));
        assert!(!apply(Op::SemVerEqual, &json!("bogus"), &json!("1.0.0"), None));
    }
}
