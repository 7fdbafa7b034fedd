//! The client façade: composes the store, data source, event pipeline, and
//! big-segment manager, and exposes the evaluation API.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::task::JoinHandle;

use flagstream_core::context::Context;
use flagstream_core::eval::{
    DataProvider, Detail, ErrorKind, Evaluator, PrerequisiteEvent, PrerequisiteEventRecorder,
    Reason, ReasonKind,
};
use flagstream_core::error::Result;
use flagstream_core::model::{Flag, Segment};
use flagstream_core::store::{DataKind, DataStore, MemoryDataStore, StoreItem};

use flagstream_events::{DiagnosticsManager, EvalEvent, EventProcessor, ReqwestEventSender};

use crate::all_flags::{AllFlagsOptions, AllFlagsState, FlagState};
use crate::big_segments::BigSegmentStoreWrapper;
use crate::config::{Config, DataSourceMode, StoreMode};
use crate::data_source::{
    DataSourceState, DataSourceStatusProvider, ExternalUpdatesDataSource, PollingDataSource,
    StreamingDataSource, UpdateSink,
};
use crate::flag_tracker::{FlagTracker, FlagValueChange};
use crate::http::HttpProperties;
use crate::store::{DataStoreStatusProvider, PersistentStoreWrapper};

/// A typed evaluation result returned by the `*_variation_detail` methods.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagDetail<T> {
    pub value: T,
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

enum ExpectedType {
    Bool,
    Int,
    Float,
    String,
    Any,
}

impl ExpectedType {
    /// Coerce a flag value into the requested type. Integer coercion from a
    /// float rounds toward zero.
    fn coerce(&self, value: &Value) -> Option<Value> {
        match self {
            Self::Bool => value.is_boolean().then(|| value.clone()),
            Self::Int => match value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Some(Value::from(i))
                    } else {
                        n.as_f64().map(|f| Value::from(f.trunc() as i64))
                    }
                }
                _ => None,
            },
            Self::Float => value.as_f64().map(Value::from),
            Self::String => value.is_string().then(|| value.clone()),
            Self::Any => Some(value.clone()),
        }
    }
}

/// The Flagstream client.
///
/// One instance per SDK key; construction starts the background workers and
/// waits up to `start_wait` for the first full dataset. Evaluation methods
/// never block on the network and never fail: on any problem they return
/// the caller's default value and explain themselves through the reason.
pub struct Client {
    sdk_key: String,
    offline: bool,
    store: Arc<dyn DataStore>,
    tracker: Arc<FlagTracker>,
    sink: Arc<UpdateSink>,
    status: Arc<DataSourceStatusProvider>,
    store_status: Option<Arc<DataStoreStatusProvider>>,
    big_segments: Option<Arc<BigSegmentStoreWrapper>>,
    events: Option<Arc<EventProcessor>>,
    external_source: Option<ExternalUpdatesDataSource>,
    data_source_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Build the client, start its workers, and wait up to
    /// `config.start_wait` for initialization. Returns the client even when
    /// initialization has not completed; observe progress through
    /// [`Client::is_initialized`] or [`Client::wait_for_initialization`].
    pub async fn new(config: Config) -> Result<Self> {
        let start_wait = config.start_wait;
        let offline = config.offline;
        let client = Self::build(config)?;
        if !offline && !start_wait.is_zero() {
            let initialized = client
                .status
                .wait_for(DataSourceState::Valid, start_wait)
                .await;
            if !initialized {
                tracing::warn!(
                    "client did not initialize within {:?}; evaluations return defaults until data arrives",
                    start_wait
                );
            }
        }
        Ok(client)
    }

    fn build(config: Config) -> Result<Self> {
        let http = HttpProperties::from_config(&config)?;

        let (store, store_status): (Arc<dyn DataStore>, Option<Arc<DataStoreStatusProvider>>) =
            match &config.store {
                StoreMode::Memory => (Arc::new(MemoryDataStore::new()) as Arc<dyn DataStore>, None),
                StoreMode::Persistent { store, cache } => {
                    let wrapper = PersistentStoreWrapper::new(Arc::clone(store), *cache);
                    let status = wrapper.status_provider();
                    (wrapper as Arc<dyn DataStore>, Some(status))
                }
            };

        let tracker = Arc::new(FlagTracker::new());
        let sink = Arc::new(UpdateSink::new(Arc::clone(&store), Arc::clone(&tracker)));
        let status = Arc::new(DataSourceStatusProvider::new());

        let big_segments = config
            .big_segments
            .as_ref()
            .map(|(store, settings)| BigSegmentStoreWrapper::new(Arc::clone(store), settings.clone()));

        let (events, diagnostics_counters) = if config.offline || !config.events_enabled {
            (None, None)
        } else {
            let sender = Arc::new(ReqwestEventSender::new(
                http.client()?,
                &config.endpoints.events_base,
                http.headers(),
            ));
            let diagnostics = (!config.events.diagnostic_opt_out)
                .then(|| DiagnosticsManager::new(&config.sdk_key, diagnostic_config(&config)));
            let counters = diagnostics.as_ref().map(DiagnosticsManager::counters);
            let processor = EventProcessor::new(config.events.clone(), sender, diagnostics);
            (Some(Arc::new(processor)), counters)
        };

        let mut external_source = None;
        let mut data_source_handle = None;
        if config.offline {
            // Nothing to connect; the client is as ready as it will get.
            status.update(DataSourceState::Valid, None);
        } else {
            match &config.data_source {
                DataSourceMode::Streaming {
                    initial_reconnect_delay,
                } => {
                    let source = StreamingDataSource::new(
                        &config.endpoints.streaming_base,
                        config.payload_filter.as_deref(),
                        http.clone(),
                        Arc::clone(&sink),
                        Arc::clone(&status),
                        *initial_reconnect_delay,
                        diagnostics_counters,
                    );
                    data_source_handle = Some(source.spawn());
                }
                DataSourceMode::Polling { interval } => {
                    let source = PollingDataSource::new(
                        &config.endpoints.polling_base,
                        config.payload_filter.as_deref(),
                        http.clone(),
                        Arc::clone(&sink),
                        Arc::clone(&status),
                        *interval,
                    );
                    data_source_handle = Some(source.spawn());
                }
                DataSourceMode::ExternalUpdatesOnly => {
                    external_source =
                        Some(ExternalUpdatesDataSource::new(Arc::clone(&store), &status));
                }
            }
        }

        Ok(Self {
            sdk_key: config.sdk_key,
            offline: config.offline,
            store,
            tracker,
            sink,
            status,
            store_status,
            big_segments,
            events,
            external_source,
            data_source_handle: Mutex::new(data_source_handle),
        })
    }

    /// Whether the SDK holds a full dataset (or cannot need one: offline).
    pub fn is_initialized(&self) -> bool {
        if self.offline {
            return true;
        }
        if let Some(external) = &self.external_source {
            return external.is_initialized();
        }
        self.sink.is_initialized()
    }

    /// Wait until the data source reports a valid dataset, the timeout
    /// elapses, or the source permanently stops.
    pub async fn wait_for_initialization(&self, timeout: Duration) -> bool {
        if self.is_initialized() {
            return true;
        }
        self.status.wait_for(DataSourceState::Valid, timeout).await
    }

    /// Flush pending analytics events, stop every background worker, and
    /// release all resources. The client must not be used afterwards.
    pub async fn close(&self) {
        if let Some(events) = &self.events {
            events.close().await;
        }
        if let Some(handle) = self
            .data_source_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.status.update(DataSourceState::Off, None);
        if let Some(big_segments) = &self.big_segments {
            big_segments.stop();
        }
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    pub fn bool_variation(&self, context: &Context, flag_key: &str, default: bool) -> bool {
        let detail = self.evaluate(context, flag_key, json!(default), ExpectedType::Bool, false);
        detail.value.as_bool().unwrap_or(default)
    }

    pub fn bool_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: bool,
    ) -> FlagDetail<bool> {
        let detail = self.evaluate(context, flag_key, json!(default), ExpectedType::Bool, true);
        FlagDetail {
            value: detail.value.as_bool().unwrap_or(default),
            variation_index: detail.variation_index,
            reason: detail.reason,
        }
    }

    pub fn int_variation(&self, context: &Context, flag_key: &str, default: i64) -> i64 {
        let detail = self.evaluate(context, flag_key, json!(default), ExpectedType::Int, false);
        detail.value.as_i64().unwrap_or(default)
    }

    pub fn int_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: i64,
    ) -> FlagDetail<i64> {
        let detail = self.evaluate(context, flag_key, json!(default), ExpectedType::Int, true);
        FlagDetail {
            value: detail.value.as_i64().unwrap_or(default),
            variation_index: detail.variation_index,
            reason: detail.reason,
        }
    }

    pub fn float_variation(&self, context: &Context, flag_key: &str, default: f64) -> f64 {
        let detail = self.evaluate(context, flag_key, json!(default), ExpectedType::Float, false);
        detail.value.as_f64().unwrap_or(default)
    }

    pub fn float_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: f64,
    ) -> FlagDetail<f64> {
        let detail = self.evaluate(context, flag_key, json!(default), ExpectedType::Float, true);
        FlagDetail {
            value: detail.value.as_f64().unwrap_or(default),
            variation_index: detail.variation_index,
            reason: detail.reason,
        }
    }

    pub fn string_variation(&self, context: &Context, flag_key: &str, default: &str) -> String {
        let detail = self.evaluate(context, flag_key, json!(default), ExpectedType::String, false);
        detail
            .value
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn string_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: &str,
    ) -> FlagDetail<String> {
        let detail = self.evaluate(context, flag_key, json!(default), ExpectedType::String, true);
        FlagDetail {
            value: detail
                .value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| default.to_string()),
            variation_index: detail.variation_index,
            reason: detail.reason,
        }
    }

    pub fn json_variation(&self, context: &Context, flag_key: &str, default: Value) -> Value {
        self.evaluate(context, flag_key, default, ExpectedType::Any, false)
            .value
    }

    pub fn json_variation_detail(
        &self,
        context: &Context,
        flag_key: &str,
        default: Value,
    ) -> FlagDetail<Value> {
        let detail = self.evaluate(context, flag_key, default, ExpectedType::Any, true);
        FlagDetail {
            value: detail.value,
            variation_index: detail.variation_index,
            reason: detail.reason,
        }
    }

    /// Evaluate every flag for one context, producing a snapshot suitable
    /// as client-side bootstrap data. Emits no analytics events.
    pub fn all_flags_state(&self, context: &Context, options: AllFlagsOptions) -> AllFlagsState {
        if !self.is_initialized() && !self.store.is_initialized() {
            tracing::warn!("all_flags_state called before initialization; returning invalid state");
            return AllFlagsState::invalid();
        }
        let Ok(flags) = self.store.all(DataKind::Features) else {
            return AllFlagsState::invalid();
        };
        let mut states = HashMap::new();
        for (key, item) in flags {
            let StoreItem::Flag(flag) = item else { continue };
            if options.client_side_only && !flag.is_client_side() {
                continue;
            }
            let detail = self.evaluate_flag_guarded(&flag, context, false);
            let is_experiment = experimentation_enabled(&flag, &detail.reason);
            let track_events = flag.track_events || is_experiment;
            let omit_details = options.details_only_for_tracked_flags
                && !track_events
                && flag.debug_events_until_date.is_none();
            states.insert(
                key,
                FlagState {
                    value: detail.value.unwrap_or(Value::Null),
                    variation: detail.variation_index,
                    version: Some(flag.version),
                    reason: (options.with_reasons || is_experiment).then_some(detail.reason),
                    track_events,
                    debug_events_until_date: flag.debug_events_until_date,
                    omit_details,
                },
            );
        }
        AllFlagsState::new(true, states)
    }

    fn evaluate(
        &self,
        context: &Context,
        flag_key: &str,
        default: Value,
        expected: ExpectedType,
        include_reason: bool,
    ) -> ResolvedDetail {
        if !self.is_initialized() && !self.store.is_initialized() {
            let detail = Detail::error(ErrorKind::ClientNotReady);
            self.record_unknown_flag(flag_key, context, &default, &detail, include_reason);
            return resolved(detail, default);
        }

        let flag = match self.store.get(DataKind::Features, flag_key) {
            Ok(Some(StoreItem::Flag(flag))) => flag,
            Ok(_) => {
                let detail = Detail::error(ErrorKind::FlagNotFound);
                self.record_unknown_flag(flag_key, context, &default, &detail, include_reason);
                return resolved(detail, default);
            }
            Err(error) => {
                tracing::error!(%error, flag_key, "data store read failed during evaluation");
                let detail = Detail::error(ErrorKind::Exception);
                self.record_unknown_flag(flag_key, context, &default, &detail, include_reason);
                return resolved(detail, default);
            }
        };

        let mut detail = self.evaluate_flag_guarded(&flag, context, true);

        // Type coercion happens before the event so the summary counts the
        // value actually returned to the caller.
        if let Some(value) = &detail.value {
            match expected.coerce(value) {
                Some(coerced) => detail.value = Some(coerced),
                None => {
                    detail = Detail {
                        value: None,
                        variation_index: None,
                        reason: Reason::error(ErrorKind::WrongType),
                    };
                }
            }
        }

        if let Some(events) = &self.events {
            events.record_evaluation(eval_event(
                &flag,
                context,
                &detail,
                default.clone(),
                include_reason,
                None,
            ));
        }
        resolved(detail, default)
    }

    /// Run the evaluator with panic containment: a bug in flag data
    /// handling must surface as `EXCEPTION`, never as an unwinding panic in
    /// an application thread.
    fn evaluate_flag_guarded(&self, flag: &Flag, context: &Context, with_events: bool) -> Detail {
        let provider = StoreProvider { store: &*self.store };
        let recorder = self.events.as_ref().filter(|_| with_events).map(|events| {
            PrerequisiteRecorder {
                events: Arc::clone(events),
            }
        });
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let mut evaluator = Evaluator::new(&provider);
            if let Some(big_segments) = &self.big_segments {
                evaluator = evaluator.with_big_segments(big_segments.as_ref());
            }
            evaluator.evaluate(
                flag,
                context,
                recorder
                    .as_ref()
                    .map(|r| r as &dyn PrerequisiteEventRecorder),
            )
        }));
        match outcome {
            Ok(detail) => detail,
            Err(_) => {
                tracing::error!(flag_key = %flag.key, "evaluation panicked");
                Detail::error(ErrorKind::Exception)
            }
        }
    }

    fn record_unknown_flag(
        &self,
        flag_key: &str,
        context: &Context,
        default: &Value,
        detail: &Detail,
        include_reason: bool,
    ) {
        if let Some(events) = &self.events {
            events.record_evaluation(EvalEvent {
                flag_key: flag_key.to_string(),
                context: context.clone(),
                value: None,
                variation_index: None,
                default_value: default.clone(),
                reason: detail.reason.clone(),
                flag_version: None,
                track_events: false,
                debug_events_until_date: None,
                include_reason,
                prereq_of: None,
            });
        }
    }

    // ------------------------------------------------------------------
    // Events and utilities
    // ------------------------------------------------------------------

    /// Report the context to the events service, refreshing its attributes.
    pub fn identify(&self, context: Context) {
        if let Some(events) = &self.events {
            events.record_identify(context);
        }
    }

    /// Record a custom event.
    pub fn track(&self, event_key: impl Into<String>, context: Context, data: Option<Value>) {
        if let Some(events) = &self.events {
            events.record_custom(event_key.into(), context, data, None);
        }
    }

    /// Record a custom event carrying a numeric metric.
    pub fn track_metric(
        &self,
        event_key: impl Into<String>,
        context: Context,
        metric_value: f64,
        data: Option<Value>,
    ) {
        if let Some(events) = &self.events {
            events.record_custom(event_key.into(), context, data, Some(metric_value));
        }
    }

    /// Ask the event pipeline to deliver everything accumulated so far.
    /// Non-blocking.
    pub fn flush(&self) {
        if let Some(events) = &self.events {
            events.flush();
        }
    }

    /// HMAC-SHA-256 of the context's fully-qualified key under the SDK key,
    /// hex-encoded, for the client-side secure mode.
    pub fn secure_mode_hash(&self, context: &Context) -> String {
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(self.sdk_key.as_bytes()) else {
            return String::new();
        };
        mac.update(context.fully_qualified_key().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    // ------------------------------------------------------------------
    // Status and trackers
    // ------------------------------------------------------------------

    /// The data source's observable connection state.
    pub fn data_source_status_provider(&self) -> Arc<DataSourceStatusProvider> {
        Arc::clone(&self.status)
    }

    /// The persistent store's status provider, when one is configured.
    pub fn data_store_status_provider(&self) -> Option<Arc<DataStoreStatusProvider>> {
        self.store_status.clone()
    }

    /// The big-segment store wrapper, when one is configured.
    pub fn big_segment_store_status(&self) -> Option<Arc<BigSegmentStoreWrapper>> {
        self.big_segments.clone()
    }

    /// The flag change tracker.
    pub fn flag_tracker(&self) -> Arc<FlagTracker> {
        Arc::clone(&self.tracker)
    }

    /// Watch one flag's evaluated value for one context; an event fires
    /// whenever a dataset change makes the value differ from the last
    /// observed one.
    pub fn flag_value_listener(
        self: Arc<Self>,
        flag_key: impl Into<String>,
        context: Context,
        default: Value,
    ) -> tokio::sync::mpsc::UnboundedReceiver<FlagValueChange> {
        let flag_key = flag_key.into();
        let tracker = Arc::clone(&self.tracker);
        let evaluate = {
            let flag_key = flag_key.clone();
            Arc::new(move || self.json_variation(&context, &flag_key, default.clone()))
                as Arc<dyn Fn() -> Value + Send + Sync>
        };
        tracker.value_change_listener(flag_key, evaluate)
    }
}

/// A [`Detail`] with the caller's default already substituted, so the typed
/// variation methods always have a concrete value to hand back.
struct ResolvedDetail {
    value: Value,
    variation_index: Option<usize>,
    reason: Reason,
}

fn resolved(detail: Detail, default: Value) -> ResolvedDetail {
    ResolvedDetail {
        value: detail.value.unwrap_or(default),
        variation_index: detail.variation_index,
        reason: detail.reason,
    }
}

/// Whether this evaluation is experiment traffic, which forces full event
/// fidelity (feature event + reason) regardless of the caller's request.
fn experimentation_enabled(flag: &Flag, reason: &Reason) -> bool {
    match &reason.kind {
        ReasonKind::Fallthrough { in_experiment } => {
            *in_experiment || flag.track_events_fallthrough
        }
        ReasonKind::RuleMatch {
            rule_index,
            in_experiment,
            ..
        } => {
            *in_experiment
                || flag
                    .rules
                    .get(*rule_index)
                    .is_some_and(|rule| rule.track_events)
        }
        _ => false,
    }
}

fn eval_event(
    flag: &Flag,
    context: &Context,
    detail: &Detail,
    default: Value,
    include_reason: bool,
    prereq_of: Option<String>,
) -> EvalEvent {
    let experiment = experimentation_enabled(flag, &detail.reason);
    EvalEvent {
        flag_key: flag.key.clone(),
        context: context.clone(),
        value: detail.value.clone(),
        variation_index: detail.variation_index,
        default_value: default,
        reason: detail.reason.clone(),
        flag_version: Some(flag.version),
        track_events: flag.track_events || experiment,
        debug_events_until_date: flag.debug_events_until_date,
        include_reason: include_reason || experiment,
        prereq_of,
    }
}

struct StoreProvider<'a> {
    store: &'a dyn DataStore,
}

impl DataProvider for StoreProvider<'_> {
    fn flag(&self, key: &str) -> Option<Arc<Flag>> {
        match self.store.get(DataKind::Features, key) {
            Ok(Some(StoreItem::Flag(flag))) => Some(flag),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(%error, key, "flag lookup failed during evaluation");
                None
            }
        }
    }

    fn segment(&self, key: &str) -> Option<Arc<Segment>> {
        match self.store.get(DataKind::Segments, key) {
            Ok(Some(StoreItem::Segment(segment))) => Some(segment),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!(%error, key, "segment lookup failed during evaluation");
                None
            }
        }
    }
}

struct PrerequisiteRecorder {
    events: Arc<EventProcessor>,
}

impl PrerequisiteEventRecorder for PrerequisiteRecorder {
    fn record(&self, event: PrerequisiteEvent) {
        self.events.record_evaluation(eval_event(
            &event.prerequisite_flag,
            &event.context,
            &event.prerequisite_result,
            Value::Null,
            false,
            Some(event.target_flag_key),
        ));
    }
}

fn diagnostic_config(config: &Config) -> Value {
    json!({
        "customStreamURI": config.endpoints.streaming_base != "https://stream.launchdarkly.com",
        "customBaseURI": config.endpoints.polling_base != "https://sdk.launchdarkly.com",
        "customEventsURI": config.endpoints.events_base != "https://events.launchdarkly.com",
        "eventsCapacity": config.events.capacity,
        "eventsFlushIntervalMillis": config.events.flush_interval.as_millis() as u64,
        "contextKeysCapacity": config.events.context_keys_capacity,
        "contextKeysFlushIntervalMillis": config.events.context_keys_flush_interval.as_millis() as u64,
        "allAttributesPrivate": config.events.all_attributes_private,
        "streamingDisabled": !matches!(config.data_source, DataSourceMode::Streaming { .. }),
        "offline": config.offline,
        "startWaitMillis": config.start_wait.as_millis() as u64,
        "usingRelayDaemon": matches!(config.data_source, DataSourceMode::ExternalUpdatesOnly),
    })
}
