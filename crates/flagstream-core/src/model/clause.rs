//! Clauses: the leaf predicates of flag and segment rules.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{AttributeRef, ContextKind};

/// Clause operators.
///
/// An operator name not recognized by this SDK version deserializes to
/// [`Op::Unknown`]; such a clause simply never matches, so newer flag data
/// degrades gracefully instead of failing the evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    In,
    EndsWith,
    StartsWith,
    Matches,
    Contains,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    #[serde(other)]
    Unknown,
}

/// A single predicate over one context attribute.
///
/// All clause values are tried disjunctively: the clause matches if the
/// attribute value (or, for array attributes, any element) relates to any
/// clause value under the operator. `negate` then flips the outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    /// Which context kind the attribute is read from. Absent means `user`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<ContextKind>,
    /// Attribute name or pointer. Interpreted as a pointer only when
    /// `contextKind` is present (newer schema); otherwise as a plain name.
    pub attribute: String,
    pub op: Op,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
    #[serde(skip)]
    pub(crate) prep: Option<ClausePrep>,
}

impl Clause {
    /// The context kind this clause reads from.
    pub fn kind(&self) -> ContextKind {
        self.context_kind.clone().unwrap_or_default()
    }

    /// The parsed attribute reference. Falls back to parsing on demand for
    /// clauses that were constructed without going through the codec.
    pub fn attribute_ref(&self) -> AttributeRef {
        if let Some(prep) = &self.prep {
            return prep.attribute.clone();
        }
        parse_clause_attribute(self.context_kind.is_some(), &self.attribute)
    }

    /// Precompute expensive per-value forms: compiled regexes, parsed
    /// versions, parsed timestamps, and a string set for multi-value `in`.
    /// Called once at dataset ingest; evaluation then never re-parses.
    pub(crate) fn prepare(&mut self) {
        let attribute = parse_clause_attribute(self.context_kind.is_some(), &self.attribute);
        let values = self
            .values
            .iter()
            .map(|v| PrepValue::for_op(self.op, v))
            .collect();
        let in_set = match self.op {
            Op::In if self.values.len() > 1 => {
                let strings: Vec<&str> = self.values.iter().filter_map(Value::as_str).collect();
                // The set shortcut only applies when every value is a string;
                // mixed-type clauses fall back to the linear scan.
                (strings.len() == self.values.len())
                    .then(|| strings.into_iter().map(str::to_string).collect())
            }
            _ => None,
        };
        self.prep = Some(ClausePrep {
            attribute,
            values,
            in_set,
        });
    }

    pub(crate) fn prep(&self) -> Option<&ClausePrep> {
        self.prep.as_ref()
    }
}

fn parse_clause_attribute(schema_has_kind: bool, attribute: &str) -> AttributeRef {
    if schema_has_kind {
        AttributeRef::new(attribute)
    } else {
        AttributeRef::literal(attribute)
    }
}

/// Precomputed companion data for a clause, parallel to `values`.
#[derive(Debug, Clone)]
pub(crate) struct ClausePrep {
    pub(crate) attribute: AttributeRef,
    pub(crate) values: Vec<PrepValue>,
    pub(crate) in_set: Option<HashSet<String>>,
}

/// A clause value parsed into the operator's comparison domain.
#[derive(Debug, Clone)]
pub(crate) enum PrepValue {
    Regex(Regex),
    SemVer(Version),
    /// Epoch milliseconds.
    Date(i64),
    /// The value needs no precomputation, or failed to parse (in which case
    /// the operator never matches against it).
    None,
}

impl PrepValue {
    fn for_op(op: Op, value: &Value) -> Self {
        match op {
            Op::Matches => value
                .as_str()
                .and_then(|s| Regex::new(s).ok())
                .map_or(Self::None, Self::Regex),
            Op::SemVerEqual | Op::SemVerLessThan | Op::SemVerGreaterThan => value
                .as_str()
                .and_then(parse_semver)
                .map_or(Self::None, Self::SemVer),
            Op::Before | Op::After => parse_date(value).map_or(Self::None, Self::Date),
            _ => Self::None,
        }
    }
}

static SEMVER_SHAPE: Lazy<Regex> = Lazy::new(|| {
    // A leading numeric core with up to three components; anything after it
    // (prerelease/build) is carried over verbatim.
    Regex::new(r"^(\d+)(\.\d+)?(\.\d+)?([\-+].*)?$").expect("static regex")
});

/// Parse a version string, tolerating omitted minor/patch components the way
/// flag data is allowed to write them (`"2"`, `"2.3"`, `"2.3-beta"`).
pub(crate) fn parse_semver(s: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(s) {
        return Some(v);
    }
    let caps = SEMVER_SHAPE.captures(s)?;
    let major = caps.get(1)?.as_str();
    let minor = caps.get(2).map_or(".0", |m| m.as_str());
    let patch = caps.get(3).map_or(".0", |m| m.as_str());
    let rest = caps.get(4).map_or("", |m| m.as_str());
    Version::parse(&format!("{major}{minor}{patch}{rest}")).ok()
}

/// Parse a date clause or attribute value to epoch milliseconds. Numbers are
/// taken as milliseconds directly; strings must be RFC 3339. Instants in
/// different zones compare by absolute time.
pub(crate) fn parse_date(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(ms) = n.as_i64() {
                Some(ms)
            } else {
                n.as_f64().map(|f| f as i64)
            }
        }
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}
