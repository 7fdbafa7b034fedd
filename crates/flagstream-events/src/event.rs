//! Event types: what producers submit and what goes out on the wire.

use serde::Serialize;
use serde_json::Value;

use flagstream_core::context::Context;
use flagstream_core::eval::Reason;

/// An evaluation record submitted by the client for every variation call.
#[derive(Debug, Clone)]
pub struct EvalEvent {
    pub flag_key: String,
    pub context: Context,
    /// The served value; `None` when the default applied.
    pub value: Option<Value>,
    pub variation_index: Option<usize>,
    pub default_value: Value,
    pub reason: Reason,
    /// Version of the evaluated flag; `None` when the flag was unknown.
    pub flag_version: Option<u64>,
    /// Whether a full feature event must be emitted for this call. The
    /// client resolves the flag-level, rule-level, and fallthrough tracking
    /// settings into this single switch.
    pub track_events: bool,
    /// Emit full-fidelity debug events until this wall-clock time
    /// (epoch milliseconds).
    pub debug_events_until_date: Option<u64>,
    /// Whether the feature event should carry the evaluation reason.
    pub include_reason: bool,
    /// Set when this evaluation happened as a prerequisite of another flag.
    pub prereq_of: Option<String>,
}

/// Everything producers can push into the pipeline.
#[derive(Debug, Clone)]
pub enum InputEvent {
    Eval(EvalEvent),
    Identify {
        context: Context,
    },
    Custom {
        key: String,
        context: Context,
        data: Option<Value>,
        metric_value: Option<f64>,
    },
}

/// Payload of a `feature` or `debug` event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FeatureEventData {
    pub(crate) creation_date: u64,
    pub(crate) key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<u64>,
    pub(crate) context: Value,
    pub(crate) value: Value,
    pub(crate) default: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) reason: Option<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) prereq_of: Option<String>,
}

/// One summary counter: how many times one (variation, version) pair of a
/// flag served a value during the window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SummaryCounter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) variation: Option<usize>,
    pub(crate) value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<u64>,
    pub(crate) count: u64,
    /// True when the flag did not exist and the default was served.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub(crate) unknown: bool,
}

/// Per-flag block of a summary event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FlagSummary {
    pub(crate) default: Value,
    pub(crate) context_kinds: Vec<String>,
    pub(crate) counters: Vec<SummaryCounter>,
}

/// Payload of the per-window `summary` event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SummaryData {
    pub(crate) start_date: u64,
    pub(crate) end_date: u64,
    pub(crate) features: std::collections::HashMap<String, FlagSummary>,
}

/// The wire form of every event delivered to the bulk endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub(crate) enum OutputEvent {
    #[serde(rename = "feature")]
    Feature(FeatureEventData),
    #[serde(rename = "debug")]
    Debug(FeatureEventData),
    #[serde(rename = "identify", rename_all = "camelCase")]
    Identify { creation_date: u64, context: Value },
    #[serde(rename = "index", rename_all = "camelCase")]
    Index { creation_date: u64, context: Value },
    #[serde(rename = "custom", rename_all = "camelCase")]
    Custom {
        creation_date: u64,
        key: String,
        context: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metric_value: Option<f64>,
    },
    #[serde(rename = "summary")]
    Summary(SummaryData),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn feature_event_wire_shape() {
        let event = OutputEvent::Feature(FeatureEventData {
            creation_date: 1000,
            key: "f".to_string(),
            version: Some(3),
            context: json!({"kind": "user", "key": "u"}),
            value: json!(true),
            default: json!(false),
            variation: Some(1),
            reason: None,
            prereq_of: None,
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "kind": "feature",
                "creationDate": 1000,
                "key": "f",
                "version": 3,
                "context": {"kind": "user", "key": "u"},
                "value": true,
                "default": false,
                "variation": 1,
            })
        );
    }

    #[test]
    fn summary_event_wire_shape() {
        let event = OutputEvent::Summary(SummaryData {
            start_date: 10,
            end_date: 20,
            features: std::collections::HashMap::from([(
                "f".to_string(),
                FlagSummary {
                    default: json!(false),
                    context_kinds: vec!["user".to_string()],
                    counters: vec![SummaryCounter {
                        variation: Some(1),
                        value: json!(true),
                        version: Some(2),
                        count: 150,
                        unknown: false,
                    }],
                },
            )]),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "kind": "summary",
                "startDate": 10,
                "endDate": 20,
                "features": {"f": {
                    "default": false,
                    "contextKinds": ["user"],
                    "counters": [{"variation": 1, "value": true, "version": 2, "count": 150}],
                }},
            })
        );
    }

    #[test]
    fn unknown_flag_counter_carries_marker() {
        let counter = SummaryCounter {
            variation: None,
            value: json!("fallback"),
            version: None,
            count: 2,
            unknown: true,
        };
        assert_eq!(
            serde_json::to_value(&counter).unwrap(),
            json!({"value": "fallback", "count": 2, "unknown": true})
        );
    }
}
