//! Per-window aggregation of evaluation counts.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::event::{EvalEvent, FlagSummary, SummaryCounter, SummaryData};

#[derive(Debug, PartialEq, Eq, Hash)]
struct CounterKey {
    variation: Option<usize>,
    version: Option<u64>,
}

#[derive(Debug)]
struct CounterState {
    value: Value,
    count: u64,
}

#[derive(Debug, Default)]
struct FlagState {
    default: Value,
    context_kinds: HashSet<String>,
    counters: HashMap<CounterKey, CounterState>,
}

/// Accumulates one summary window: for each
/// `(flag, variation, version)` a 64-bit counter plus the window's first and
/// last evaluation timestamps.
#[derive(Debug, Default)]
pub(crate) struct EventSummarizer {
    start_date: u64,
    end_date: u64,
    flags: HashMap<String, FlagState>,
}

impl EventSummarizer {
    pub(crate) fn add(&mut self, event: &EvalEvent, timestamp: u64) {
        if self.start_date == 0 || timestamp < self.start_date {
            self.start_date = timestamp;
        }
        if timestamp > self.end_date {
            self.end_date = timestamp;
        }
        let flag = self
            .flags
            .entry(event.flag_key.clone())
            .or_insert_with(|| FlagState {
                default: event.default_value.clone(),
                ..FlagState::default()
            });
        for kind in event.context.kinds() {
            flag.context_kinds.insert(kind.as_str().to_string());
        }
        let served = event
            .value
            .clone()
            .unwrap_or_else(|| event.default_value.clone());
        let counter = flag
            .counters
            .entry(CounterKey {
                variation: event.variation_index,
                version: event.flag_version,
            })
            .or_insert_with(|| CounterState {
                value: served,
                count: 0,
            });
        counter.count += 1;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Close the window and emit its summary payload, resetting for the next
    /// interval.
    pub(crate) fn take(&mut self) -> Option<SummaryData> {
        if self.is_empty() {
            return None;
        }
        let flags = std::mem::take(&mut self.flags);
        let data = SummaryData {
            start_date: self.start_date,
            end_date: self.end_date,
            features: flags
                .into_iter()
                .map(|(key, state)| {
                    let mut context_kinds: Vec<String> = state.context_kinds.into_iter().collect();
                    context_kinds.sort();
                    let counters = state
                        .counters
                        .into_iter()
                        .map(|(counter_key, counter)| SummaryCounter {
                            variation: counter_key.variation,
                            value: counter.value,
                            version: counter_key.version,
                            count: counter.count,
                            unknown: counter_key.version.is_none(),
                        })
                        .collect();
                    (
                        key,
                        FlagSummary {
                            default: state.default,
                            context_kinds,
                            counters,
                        },
                    )
                })
                .collect(),
        };
        self.start_date = 0;
        self.end_date = 0;
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagstream_core::context::Context;
    use flagstream_core::eval::Reason;
    use serde_json::json;

    fn eval_event(flag_key: &str, context_key: &str, variation: Option<usize>, value: Value) -> EvalEvent {
        EvalEvent {
            flag_key: flag_key.to_string(),
            context: Context::builder(context_key).build().unwrap(),
            value: Some(value),
            variation_index: variation,
            default_value: json!(false),
            reason: Reason::fallthrough(false),
            flag_version: Some(2),
            track_events: false,
            debug_events_until_date: None,
            include_reason: false,
            prereq_of: None,
        }
    }

    #[test]
    fn counts_accumulate_per_variation() {
        let mut summarizer = EventSummarizer::default();
        for _ in 0..100 {
            summarizer.add(&eval_event("flag1", "u1", Some(1), json!(true)), 1000);
        }
        for _ in 0..50 {
            summarizer.add(&eval_event("flag1", "u2", Some(1), json!(true)), 2000);
        }
        let data = summarizer.take().unwrap();
        assert_eq!(data.start_date, 1000);
        assert_eq!(data.end_date, 2000);
        let flag = &data.features["flag1"];
        assert_eq!(flag.counters.len(), 1);
        assert_eq!(flag.counters[0].count, 150);
        assert_eq!(flag.counters[0].value, json!(true));
        assert_eq!(flag.context_kinds, vec!["user".to_string()]);
        // Window resets after take.
        assert!(summarizer.take().is_none());
    }

    #[test]
    fn distinct_variations_get_distinct_counters() {
        let mut summarizer = EventSummarizer::default();
        summarizer.add(&eval_event("f", "u", Some(0), json!(false)), 1);
        summarizer.add(&eval_event("f", "u", Some(1), json!(true)), 2);
        let data = summarizer.take().unwrap();
        assert_eq!(data.features["f"].counters.len(), 2);
    }

    #[test]
    fn unknown_flag_marks_counter() {
        let mut summarizer = EventSummarizer::default();
        let mut event = eval_event("ghost", "u", None, json!(false));
        event.flag_version = None;
        event.value = None;
        summarizer.add(&event, 1);
        let data = summarizer.take().unwrap();
        let counter = &data.features["ghost"].counters[0];
        assert!(counter.unknown);
        assert_eq!(counter.value, json!(false));
    }

    #[test]
    fn context_kinds_collected_across_events() {
        let mut summarizer = EventSummarizer::default();
        let mut event = eval_event("f", "u", Some(0), json!(false));
        summarizer.add(&event, 1);
        let org = Context::builder("acme").kind("org").build().unwrap();
        event.context = org;
        summarizer.add(&event, 2);
        let data = summarizer.take().unwrap();
        assert_eq!(
            data.features["f"].context_kinds,
            vec!["org".to_string(), "user".to_string()]
        );
    }
}
