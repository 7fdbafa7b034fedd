//! End-to-end tests of the event pipeline with a capturing sender.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use flagstream_core::context::Context;
use flagstream_core::eval::Reason;
use flagstream_events::{
    DiagnosticsManager, EvalEvent, EventProcessor, EventSender, EventSenderResult, EventsConfig,
};

#[derive(Default)]
struct CapturingSender {
    analytics: Mutex<Vec<(Value, String)>>,
    diagnostics: Mutex<Vec<Value>>,
    shutdown_after_first: bool,
}

impl CapturingSender {
    fn payload_count(&self) -> usize {
        self.analytics.lock().unwrap().len()
    }

    fn payloads(&self) -> Vec<Value> {
        self.analytics.lock().unwrap().iter().map(|(v, _)| v.clone()).collect()
    }
}

#[async_trait]
impl EventSender for CapturingSender {
    async fn send_analytics(&self, body: Value, payload_id: &str) -> EventSenderResult {
        let mut analytics = self.analytics.lock().unwrap();
        analytics.push((body, payload_id.to_string()));
        EventSenderResult {
            success: !self.shutdown_after_first,
            must_shutdown: self.shutdown_after_first,
            server_time: None,
        }
    }

    async fn send_diagnostic(&self, body: Value) -> EventSenderResult {
        self.diagnostics.lock().unwrap().push(body);
        EventSenderResult {
            success: true,
            must_shutdown: false,
            server_time: None,
        }
    }
}

fn test_config() -> EventsConfig {
    EventsConfig {
        // Long timers so only explicit flushes drive the tests.
        flush_interval: Duration::from_secs(600),
        context_keys_flush_interval: Duration::from_secs(600),
        diagnostic_opt_out: true,
        ..EventsConfig::default()
    }
}

fn eval_event(flag_key: &str, context_key: &str) -> EvalEvent {
    EvalEvent {
        flag_key: flag_key.to_string(),
        context: Context::builder(context_key).build().unwrap(),
        value: Some(json!(true)),
        variation_index: Some(1),
        default_value: json!(false),
        reason: Reason::fallthrough(false),
        flag_version: Some(2),
        track_events: false,
        debug_events_until_date: None,
        include_reason: false,
        prereq_of: None,
    }
}

async fn wait_for_payloads(sender: &CapturingSender, count: usize) {
    for _ in 0..200 {
        if sender.payload_count() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {count} payloads, got {} after timeout",
        sender.payload_count()
    );
}

fn events_of_kind<'a>(payload: &'a Value, kind: &str) -> Vec<&'a Value> {
    payload
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["kind"] == kind)
        .collect()
}

#[tokio::test]
async fn summary_aggregation_with_index_dedup() {
    let sender = Arc::new(CapturingSender::default());
    let processor = EventProcessor::new(test_config(), sender.clone(), None);

    for _ in 0..100 {
        processor.record_evaluation(eval_event("flag1", "u1"));
    }
    for _ in 0..50 {
        processor.record_evaluation(eval_event("flag1", "u2"));
    }
    processor.flush();
    wait_for_payloads(&sender, 1).await;

    let payloads = sender.payloads();
    let payload = &payloads[0];

    // One index event per distinct context key, no feature events.
    assert_eq!(events_of_kind(payload, "index").len(), 2);
    assert!(events_of_kind(payload, "feature").is_empty());

    let summaries = events_of_kind(payload, "summary");
    assert_eq!(summaries.len(), 1);
    let counters = summaries[0]["features"]["flag1"]["counters"].as_array().unwrap();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0]["count"], 150);
    assert_eq!(counters[0]["variation"], 1);
    assert_eq!(counters[0]["value"], true);

    processor.close().await;
}

#[tokio::test]
async fn tracked_flag_emits_feature_events() {
    let sender = Arc::new(CapturingSender::default());
    let processor = EventProcessor::new(test_config(), sender.clone(), None);

    let mut event = eval_event("flag1", "u1");
    event.track_events = true;
    event.include_reason = true;
    processor.record_evaluation(event.clone());
    processor.record_evaluation(event);
    processor.flush();
    wait_for_payloads(&sender, 1).await;

    let payloads = sender.payloads();
    let features = events_of_kind(&payloads[0], "feature");
    assert_eq!(features.len(), 2);
    assert_eq!(features[0]["key"], "flag1");
    assert_eq!(features[0]["reason"]["kind"], "FALLTHROUGH");
    assert_eq!(features[0]["context"]["key"], "u1");

    processor.close().await;
}

#[tokio::test]
async fn debug_window_emits_debug_events() {
    let sender = Arc::new(CapturingSender::default());
    let processor = EventProcessor::new(test_config(), sender.clone(), None);

    let mut event = eval_event("flag1", "u1");
    event.debug_events_until_date = Some(u64::MAX);
    processor.record_evaluation(event);

    let mut expired = eval_event("flag1", "u1");
    expired.debug_events_until_date = Some(1);
    processor.record_evaluation(expired);

    processor.flush();
    wait_for_payloads(&sender, 1).await;

    let payloads = sender.payloads();
    assert_eq!(events_of_kind(&payloads[0], "debug").len(), 1);

    processor.close().await;
}

#[tokio::test]
async fn identify_announces_context_and_suppresses_index() {
    let sender = Arc::new(CapturingSender::default());
    let processor = EventProcessor::new(test_config(), sender.clone(), None);

    let context = Context::builder("u1").build().unwrap();
    processor.record_identify(context);
    processor.record_evaluation(eval_event("flag1", "u1"));
    processor.flush();
    wait_for_payloads(&sender, 1).await;

    let payloads = sender.payloads();
    assert_eq!(events_of_kind(&payloads[0], "identify").len(), 1);
    assert!(events_of_kind(&payloads[0], "index").is_empty());

    processor.close().await;
}

#[tokio::test]
async fn anonymous_contexts_are_never_indexed() {
    let sender = Arc::new(CapturingSender::default());
    let processor = EventProcessor::new(test_config(), sender.clone(), None);

    let mut event = eval_event("flag1", "anon-user");
    event.context = Context::builder("anon-user").anonymous(true).build().unwrap();
    processor.record_evaluation(event);
    processor.flush();
    wait_for_payloads(&sender, 1).await;

    let payloads = sender.payloads();
    assert!(events_of_kind(&payloads[0], "index").is_empty());
    assert_eq!(events_of_kind(&payloads[0], "summary").len(), 1);

    processor.close().await;
}

#[tokio::test]
async fn custom_events_carry_data_and_metric() {
    let sender = Arc::new(CapturingSender::default());
    let processor = EventProcessor::new(test_config(), sender.clone(), None);

    let context = Context::builder("u1").build().unwrap();
    processor.record_custom(
        "checkout".to_string(),
        context,
        Some(json!({"cart": 3})),
        Some(9.99),
    );
    processor.flush();
    wait_for_payloads(&sender, 1).await;

    let payloads = sender.payloads();
    let customs = events_of_kind(&payloads[0], "custom");
    assert_eq!(customs.len(), 1);
    assert_eq!(customs[0]["key"], "checkout");
    assert_eq!(customs[0]["data"]["cart"], 3);
    assert_eq!(customs[0]["metricValue"], 9.99);
    // Custom events announce the context too.
    assert_eq!(events_of_kind(&payloads[0], "index").len(), 1);

    processor.close().await;
}

#[tokio::test]
async fn event_buffer_is_bounded_and_drops_overflow() {
    let sender = Arc::new(CapturingSender::default());
    let config = EventsConfig {
        capacity: 5,
        ..test_config()
    };
    let processor = EventProcessor::new(config, sender.clone(), None);

    for i in 0..50 {
        let mut event = eval_event("flag1", &format!("u{i}"));
        event.track_events = true;
        processor.record_evaluation(event);
    }
    // Give the worker time to accumulate, then flush once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    processor.flush();
    wait_for_payloads(&sender, 1).await;

    let payloads = sender.payloads();
    let events = payloads[0].as_array().unwrap();
    // At most `capacity` buffered events plus the summary; the rest were
    // dropped rather than blocking anything.
    assert!(events.len() <= 6, "got {} events", events.len());
    assert_eq!(events_of_kind(&payloads[0], "summary").len(), 1);

    processor.close().await;
}

#[tokio::test]
async fn permanent_delivery_failure_disables_pipeline() {
    let sender = Arc::new(CapturingSender {
        shutdown_after_first: true,
        ..CapturingSender::default()
    });
    let processor = EventProcessor::new(test_config(), sender.clone(), None);

    processor.record_evaluation(eval_event("flag1", "u1"));
    processor.flush();
    wait_for_payloads(&sender, 1).await;

    // The pipeline saw must_shutdown; further events are silently dropped.
    tokio::time::sleep(Duration::from_millis(50)).await;
    processor.record_evaluation(eval_event("flag1", "u2"));
    processor.flush();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sender.payload_count(), 1);

    processor.close().await;
}

#[tokio::test]
async fn diagnostics_init_event_sent_on_startup() {
    let sender = Arc::new(CapturingSender::default());
    let config = EventsConfig {
        diagnostic_opt_out: false,
        ..test_config()
    };
    let manager = DiagnosticsManager::new("sdk-key-abcdef", json!({"custom": true}));
    let processor = EventProcessor::new(config, sender.clone(), Some(manager));

    for _ in 0..200 {
        if !sender.diagnostics.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let diagnostics = sender.diagnostics.lock().unwrap().clone();
    assert!(!diagnostics.is_empty(), "no diagnostic init event arrived");
    assert_eq!(diagnostics[0]["kind"], "diagnostic-init");

    processor.close().await;
}
