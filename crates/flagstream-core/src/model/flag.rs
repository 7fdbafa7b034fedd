//! Feature flag definitions as published by the flag delivery service.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::clause::Clause;
use super::rollout::VariationOrRollout;
use crate::context::{Context, ContextKind};

/// A reference to another flag that must evaluate to a specific variation
/// before this flag can serve anything but its off variation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
}

/// An explicit list of context keys mapped to one variation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Context kind the keys belong to; absent in the legacy user-target
    /// lists, where it means `user`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_kind: Option<ContextKind>,
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: usize,
    #[serde(skip)]
    values_set: Option<HashSet<String>>,
}

impl Target {
    /// The kind this target applies to.
    pub fn kind(&self) -> ContextKind {
        self.context_kind.clone().unwrap_or_default()
    }

    /// Whether the target list contains the given key.
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

/// An ordered rule: a clause conjunction plus the variation or rollout it
/// selects when all clauses match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// Exposure of a flag to client-side SDKs. The legacy single-boolean form is
/// still read from older payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideAvailability {
    #[serde(default)]
    pub using_environment_id: bool,
    #[serde(default)]
    pub using_mobile_key: bool,
}

/// A feature flag: the unit of runtime decision.
///
/// Flags are immutable once stored; the data source replaces whole items by
/// version. Instances are prepared once at ingest ([`Flag::prepare`]) so that
/// evaluation touches no unparsed regex/semver/date text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    pub version: u64,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    /// Legacy user-kind target lists, checked after `context_targets`.
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub context_targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(default)]
    pub fallthrough: VariationOrRollout,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<usize>,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_side_availability: Option<ClientSideAvailability>,
    /// Legacy form of `client_side_availability.using_environment_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_side: Option<bool>,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    /// Epoch milliseconds until which full debug events are emitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl Flag {
    /// The variation value at `index`, if in range.
    pub fn variation_value(&self, index: usize) -> Option<&Value> {
        self.variations.get(index)
    }

    /// Whether the flag is exposed to client-side JavaScript SDKs.
    pub fn is_client_side(&self) -> bool {
        self.client_side_availability
            .map(|a| a.using_environment_id)
            .or(self.client_side)
            .unwrap_or(false)
    }

    /// Whether the first matching context-kind-qualified or user target list
    /// selects a variation for this context.
    pub fn target_match(&self, context: &Context) -> Option<usize> {
        for target in &self.context_targets {
            let kind = target.kind();
            if kind.is_user() && target.values.is_empty() {
                // A user-kind context target is a placeholder preserving
                // ordering; the actual keys live in the legacy list below.
                if let Some(variation) = self.user_target_match(context, target.variation) {
                    return Some(variation);
                }
                continue;
            }
            if let Some(single) = context.as_kind(&kind) {
                if target.contains(single.key()) {
                    return Some(target.variation);
                }
            }
        }
        if self.context_targets.is_empty() {
            for target in &self.targets {
                if let Some(single) = context.as_kind(&ContextKind::user()) {
                    if target.contains(single.key()) {
                        return Some(target.variation);
                    }
                }
            }
        }
        None
    }

    fn user_target_match(&self, context: &Context, variation: usize) -> Option<usize> {
        let single = context.as_kind(&ContextKind::user())?;
        self.targets
            .iter()
            .find(|t| t.variation == variation && t.contains(single.key()))
            .map(|t| t.variation)
    }

    /// Build all precomputed forms. The codec calls this for every flag it
    /// decodes; hand-constructed flags in tests may skip it and fall back to
    /// the unprepared paths.
    pub fn prepare(&mut self) {
        for target in self.targets.iter_mut().chain(self.context_targets.iter_mut()) {
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

    pub(crate) fn minimal_flag(key: &str) -> Flag {
        serde_json::from_value(json!({
            "key": key,
            "version": 1,
            "on": true,
            "variations": [false, true],
            "fallthrough": {"variation": 1},
            "offVariation": 0,
            "salt": "salty",
        }))
        .unwrap()
    }

    #[test]
    fn decodes_minimal_flag_with_defaults() {
        let flag = minimal_flag("f");
        assert!(flag.on);
        assert!(flag.prerequisites.is_empty());
        assert!(!flag.track_events);
        assert!(!flag.deleted);
        assert_eq!(flag.off_variation, Some(0));
        assert_eq!(flag.variation_value(1), Some(&json!(true)));
        assert_eq!(flag.variation_value(5), None);
    }

    #[test]
    fn client_side_both_schemas() {
        let legacy: Flag = serde_json::from_value(json!({
            "key": "f", "version": 1, "clientSide": true,
        }))
        .unwrap();
        assert!(legacy.is_client_side());

        let current: Flag = serde_json::from_value(json!({
            "key": "f", "version": 1,
            "clientSideAvailability": {"usingEnvironmentId": true, "usingMobileKey": false},
        }))
        .unwrap();
        assert!(current.is_client_side());

        let absent: Flag = serde_json::from_value(json!({"key": "f", "version": 1})).unwrap();
        assert!(!absent.is_client_side());
    }

    #[test]
    fn user_targets_match_user_contexts_only() {
        let mut flag = minimal_flag("f");
        flag.targets = vec![serde_json::from_value(json!({
            "values": ["u7"], "variation": 1,
        }))
        .unwrap()];
        flag.prepare();

        let hit = Context::builder("u7").build().unwrap();
        let miss = Context::builder("u8").build().unwrap();
        let org = Context::builder("u7").kind("org").build().unwrap();
        assert_eq!(flag.target_match(&hit), Some(1));
        assert_eq!(flag.target_match(&miss), None);
        assert_eq!(flag.target_match(&org), None);
    }

    #[test]
    fn context_targets_take_precedence_and_placeholders_defer() {
        let mut flag = minimal_flag("f");
        flag.targets = vec![serde_json::from_value(json!({
            "values": ["u1"], "variation": 0,
        }))
        .unwrap()];
        flag.context_targets = vec![
            serde_json::from_value(json!({
                "contextKind": "org", "values": ["acme"], "variation": 1,
            }))
            .unwrap(),
            // user placeholder: keys come from the legacy list
            serde_json::from_value(json!({
                "contextKind": "user", "values": [], "variation": 0,
            }))
            .unwrap(),
        ];
        flag.prepare();

        let org = Context::builder("acme").kind("org").build().unwrap();
        assert_eq!(flag.target_match(&org), Some(1));
        let user = Context::builder("u1").build().unwrap();
        assert_eq!(flag.target_match(&user), Some(0));
    }
}
