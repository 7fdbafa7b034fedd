//! Segment definitions: named populations of contexts.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::clause::Clause;
use crate::context::ContextKind;

/// A per-kind inclusion or exclusion list inside a segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<ContextKind>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(skip)]
    values_set: Option<HashSet<String>>,
}

impl SegmentTarget {
    /// The kind this list applies to.
    pub fn kind(&self) -> ContextKind {
        self.context_kind.clone().unwrap_or_default()
    }

    /// Whether the list contains the given key.
    pub fn contains(&self, key: &str) -> bool {
        match &self.values_set {
            Some(set) => set.contains(key),
            None => self.values.iter().any(|v| v == key),
        }
    }

    fn prepare(&mut self) {
        self.values_set = Some(self.values.iter().cloned().collect());
    }
}

/// A segment rule: clauses plus an optional percentage-of-population weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    /// Out of 100000. Absent means every matching context is in the segment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout_context_kind: Option<ContextKind>,
}

/// A named population of contexts, referenced from flag rules through the
/// `segmentMatch` operator.
///
/// `unbounded` segments ("big segments") do not inline their membership;
/// evaluation consults the external big-segment store for those, using the
/// generation-qualified reference from [`Segment::reference`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    pub version: u64,
    /// Legacy user-kind inclusion list.
    #[serde(default)]
    pub included: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub included_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub excluded_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub unbounded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unbounded_context_kind: Option<ContextKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(skip)]
    included_set: Option<HashSet<String>>,
    #[serde(skip)]
    excluded_set: Option<HashSet<String>>,
}

impl Segment {
    /// The membership-store reference for an unbounded segment. Membership
    /// written by one generation of a segment is not valid for another, so
    /// the generation is part of the key.
    pub fn reference(&self) -> String {
        match self.generation {
            Some(generation) => format!("{}.g{generation}", self.key),
            None => self.key.clone(),
        }
    }

    /// The context kind whose key is hashed for big-segment queries.
    pub fn unbounded_kind(&self) -> ContextKind {
        self.unbounded_context_kind.clone().unwrap_or_default()
    }

    /// Whether the legacy user inclusion list contains the key.
    pub fn included_contains(&self, key: &str) -> bool {
        match &self.included_set {
            Some(set) => set.contains(key),
            None => self.included.iter().any(|v| v == key),
        }
    }

    /// Whether the legacy user exclusion list contains the key.
    pub fn excluded_contains(&self, key: &str) -> bool {
        match &self.excluded_set {
            Some(set) => set.contains(key),
            None => self.excluded.iter().any(|v| v == key),
        }
    }

    /// Build precomputed key sets and clause preprocessing, as
    /// [`Flag::prepare`](super::Flag::prepare) does for flags.
    pub fn prepare(&mut self) {
        self.included_set = Some(self.included.iter().cloned().collect());
        self.excluded_set = Some(self.excluded.iter().cloned().collect());
        for target in self
            .included_contexts
            .iter_mut()
            .chain(self.excluded_contexts.iter_mut())
        {
            target.prepare();
        }
        for rule in &mut self.rules {
            for clause in &mut rule.clauses {
                clause.prepare();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_with_defaults() {
        let segment: Segment =
            serde_json::from_value(json!({"key": "s", "version": 3})).unwrap();
        assert!(!segment.unbounded);
        assert!(segment.generation.is_none());
        assert!(segment.rules.is_empty());
        assert_eq!(segment.reference(), "s");
    }

    #[test]
    fn generation_qualifies_reference() {
        let segment: Segment = serde_json::from_value(json!({
            "key": "s", "version": 3, "unbounded": true, "generation": 2,
        }))
        .unwrap();
        assert_eq!(segment.reference(), "s.g2");
        assert!(segment.unbounded_kind().is_user());
    }

    #[test]
    fn membership_lists_after_prepare() {
        let mut segment: Segment = serde_json::from_value(json!({
            "key": "s", "version": 1,
            "included": ["a"],
            "excluded": ["b"],
            "includedContexts": [{"contextKind": "org", "values": ["acme"]}],
        }))
        .unwrap();
        segment.prepare();
        assert!(segment.included_contains("a"));
        assert!(!segment.included_contains("b"));
        assert!(segment.excluded_contains("b"));
        assert!(segment.included_contexts[0].contains("acme"));
        assert_eq!(segment.included_contexts[0].kind().as_str(), "org");
    }
}
