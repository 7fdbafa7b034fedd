//! The event pipeline worker and its producer-facing handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use flagstream_core::context::Context;

use crate::config::EventsConfig;
use crate::dedup::ContextKeyDeduplicator;
use crate::diagnostics::{DiagnosticCounters, DiagnosticsManager};
use crate::event::{EvalEvent, FeatureEventData, InputEvent, OutputEvent};
use crate::now_millis;
use crate::redaction::EventContextFormatter;
use crate::sender::EventSender;
use crate::summarizer::EventSummarizer;

/// How many composed flush payloads may wait for the HTTP sender before
/// further flushes are dropped. Deliberately small: a sender that cannot
/// keep up must shed load rather than grow a queue.
const DELIVERY_QUEUE_SIZE: usize = 5;

enum EventMessage {
    Event(Box<InputEvent>),
    Flush,
    Close(oneshot::Sender<()>),
}

/// Producer handle for the event pipeline.
///
/// All `record_*` methods and [`EventProcessor::flush`] are non-blocking:
/// they offer to a bounded channel and drop (with a once-per-outage log)
/// when the pipeline cannot keep up. A single worker task owns every buffer.
pub struct EventProcessor {
    input: mpsc::Sender<EventMessage>,
    disabled: Arc<AtomicBool>,
    input_full_logged: AtomicBool,
    counters: Option<Arc<DiagnosticCounters>>,
    handles: Mutex<WorkerHandles>,
}

#[derive(Default)]
struct WorkerHandles {
    worker: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
    diagnostics: Option<JoinHandle<()>>,
}

impl EventProcessor {
    /// Start the pipeline: the accumulation worker, the HTTP delivery
    /// worker, and (unless opted out) the periodic diagnostics task.
    pub fn new(
        config: EventsConfig,
        sender: Arc<dyn EventSender>,
        diagnostics: Option<DiagnosticsManager>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::channel(config.capacity.max(1));
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_SIZE);
        let disabled = Arc::new(AtomicBool::new(false));
        let server_time = Arc::new(AtomicU64::new(0));
        let counters = diagnostics.as_ref().map(DiagnosticsManager::counters);

        let mut handles = WorkerHandles::default();
        handles.delivery = Some(tokio::spawn(run_delivery(
            delivery_rx,
            Arc::clone(&sender),
            Arc::clone(&disabled),
            Arc::clone(&server_time),
        )));
        if let Some(manager) = diagnostics {
            if !config.diagnostic_opt_out {
                handles.diagnostics = Some(tokio::spawn(run_diagnostics(
                    manager,
                    Arc::clone(&sender),
                    Arc::clone(&disabled),
                    config.diagnostic_recording_interval,
                )));
            }
        }
        let worker = Worker {
            formatter: EventContextFormatter::new(
                config.all_attributes_private,
                config.private_attributes.clone(),
            ),
            summarizer: EventSummarizer::default(),
            dedup: ContextKeyDeduplicator::new(config.context_keys_capacity),
            outbox: Vec::new(),
            delivery_tx,
            server_time,
            counters: counters.clone(),
            capacity: config.capacity,
            outbox_full_logged: false,
            delivery_full_logged: false,
        };
        handles.worker = Some(tokio::spawn(run_worker(worker, input_rx, config)));

        Self {
            input: input_tx,
            disabled,
            input_full_logged: AtomicBool::new(false),
            counters,
            handles: Mutex::new(handles),
        }
    }

    /// Record the result of one variation call.
    pub fn record_evaluation(&self, event: EvalEvent) {
        self.submit(InputEvent::Eval(event));
    }

    /// Record an explicit identify call.
    pub fn record_identify(&self, context: Context) {
        self.submit(InputEvent::Identify { context });
    }

    /// Record a custom event, optionally with data and a metric value.
    pub fn record_custom(
        &self,
        key: String,
        context: Context,
        data: Option<Value>,
        metric_value: Option<f64>,
    ) {
        self.submit(InputEvent::Custom {
            key,
            context,
            data,
            metric_value,
        });
    }

    /// Ask the worker to deliver everything accumulated so far. Returns
    /// immediately.
    pub fn flush(&self) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.input.try_send(EventMessage::Flush);
    }

    /// Flush, stop all workers, and wait for pending deliveries to drain.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.input.send(EventMessage::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        let handles = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        // The worker exits after its final flush; once its side of the
        // delivery channel drops, the delivery task drains what is queued
        // and exits too. Diagnostics just sleeps between ticks; abort it.
        if let Some(worker) = handles.worker {
            let _ = worker.await;
        }
        if let Some(delivery) = handles.delivery {
            let _ = delivery.await;
        }
        if let Some(diagnostics) = handles.diagnostics {
            diagnostics.abort();
        }
    }

    fn submit(&self, event: InputEvent) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }
        match self.input.try_send(EventMessage::Event(Box::new(event))) {
            Ok(()) => {
                self.input_full_logged.store(false, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if let Some(counters) = &self.counters {
                    counters.record_dropped_events(1);
                }
                if !self.input_full_logged.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "event input queue is full; dropping events until it drains"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

struct Worker {
    formatter: EventContextFormatter,
    summarizer: EventSummarizer,
    dedup: ContextKeyDeduplicator,
    outbox: Vec<OutputEvent>,
    delivery_tx: mpsc::Sender<Vec<OutputEvent>>,
    server_time: Arc<AtomicU64>,
    counters: Option<Arc<DiagnosticCounters>>,
    capacity: usize,
    outbox_full_logged: bool,
    delivery_full_logged: bool,
}

async fn run_worker(mut worker: Worker, mut input: mpsc::Receiver<EventMessage>, config: EventsConfig) {
    let mut flush_timer = tokio::time::interval(config.flush_interval);
    let mut dedup_timer = tokio::time::interval(config.context_keys_flush_interval);
    loop {
        tokio::select! {
            message = input.recv() => match message {
                Some(EventMessage::Event(event)) => worker.process(*event),
                Some(EventMessage::Flush) => worker.flush(),
                Some(EventMessage::Close(ack)) => {
                    worker.flush();
                    let _ = ack.send(());
                    break;
                }
                None => break,
            },
            _ = flush_timer.tick() => worker.flush(),
            _ = dedup_timer.tick() => worker.dedup.reset(),
        }
    }
}

impl Worker {
    fn process(&mut self, event: InputEvent) {
        let timestamp = now_millis();
        match event {
            InputEvent::Eval(event) => {
                self.summarizer.add(&event, timestamp);
                self.maybe_index(&event.context, timestamp);
                if event.track_events {
                    let data = self.feature_data(&event, timestamp, true);
                    self.push(OutputEvent::Feature(data));
                }
                if self.should_debug(&event, timestamp) {
                    let data = self.feature_data(&event, timestamp, false);
                    self.push(OutputEvent::Debug(data));
                }
            }
            InputEvent::Identify { context } => {
                // Identify counts as announcing the context, so later
                // evaluations in this window need no index event.
                self.dedup.note(&context.fully_qualified_key());
                let context = self.formatter.format(&context, false);
                self.push(OutputEvent::Identify {
                    creation_date: timestamp,
                    context,
                });
            }
            InputEvent::Custom {
                key,
                context,
                data,
                metric_value,
            } => {
                self.maybe_index(&context, timestamp);
                let context = self.formatter.format(&context, false);
                self.push(OutputEvent::Custom {
                    creation_date: timestamp,
                    key,
                    context,
                    data,
                    metric_value,
                });
            }
        }
    }

    /// Feature events redact attributes of anonymous context kinds; debug
    /// events carry the full (privacy-redacted) context.
    fn feature_data(&self, event: &EvalEvent, timestamp: u64, redact_anonymous: bool) -> FeatureEventData {
        FeatureEventData {
            creation_date: timestamp,
            key: event.flag_key.clone(),
            version: event.flag_version,
            context: self.formatter.format(&event.context, redact_anonymous),
            value: event
                .value
                .clone()
                .unwrap_or_else(|| event.default_value.clone()),
            default: event.default_value.clone(),
            variation: event.variation_index,
            reason: event.include_reason.then(|| event.reason.clone()),
            prereq_of: event.prereq_of.clone(),
        }
    }

    fn should_debug(&self, event: &EvalEvent, timestamp: u64) -> bool {
        let Some(until) = event.debug_events_until_date else {
            return false;
        };
        // The debug window is set on service wall clocks; once a response
        // has told us the server time, trust it over the local clock.
        until > timestamp && until > self.server_time.load(Ordering::Relaxed)
    }

    fn maybe_index(&mut self, context: &Context, timestamp: u64) {
        if context.individual_contexts().iter().all(|c| c.anonymous()) {
            return;
        }
        let key = context.fully_qualified_key();
        if self.dedup.note(&key) {
            if let Some(counters) = &self.counters {
                counters.record_deduplicated_context();
            }
            return;
        }
        let context = self.formatter.format(context, false);
        self.push(OutputEvent::Index {
            creation_date: timestamp,
            context,
        });
    }

    fn push(&mut self, event: OutputEvent) {
        if self.outbox.len() >= self.capacity {
            if let Some(counters) = &self.counters {
                counters.record_dropped_events(1);
            }
            if !self.outbox_full_logged {
                self.outbox_full_logged = true;
                tracing::warn!("event buffer is full; dropping events until the next flush");
            }
            return;
        }
        self.outbox.push(event);
    }

    fn flush(&mut self) {
        let summary = self.summarizer.take();
        if self.outbox.is_empty() && summary.is_none() {
            return;
        }
        self.outbox_full_logged = false;
        let mut events = std::mem::take(&mut self.outbox);
        if let Some(summary) = summary {
            events.push(OutputEvent::Summary(summary));
        }
        let count = events.len() as u64;
        match self.delivery_tx.try_send(events) {
            Ok(()) => {
                self.delivery_full_logged = false;
                if let Some(counters) = &self.counters {
                    counters.record_batch(count);
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if let Some(counters) = &self.counters {
                    counters.record_dropped_events(count);
                }
                if !self.delivery_full_logged {
                    self.delivery_full_logged = true;
                    tracing::warn!("event delivery queue is full; dropping flush payload");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

async fn run_delivery(
    mut payloads: mpsc::Receiver<Vec<OutputEvent>>,
    sender: Arc<dyn EventSender>,
    disabled: Arc<AtomicBool>,
    server_time: Arc<AtomicU64>,
) {
    while let Some(events) = payloads.recv().await {
        if disabled.load(Ordering::Relaxed) {
            continue;
        }
        let body = match serde_json::to_value(&events) {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(%error, "failed to serialize event payload");
                continue;
            }
        };
        let payload_id = Uuid::new_v4().to_string();
        let result = sender.send_analytics(body, &payload_id).await;
        if result.must_shutdown {
            disabled.store(true, Ordering::Relaxed);
        }
        if let Some(time) = result.server_time {
            server_time.store(time, Ordering::Relaxed);
        }
    }
}

async fn run_diagnostics(
    manager: DiagnosticsManager,
    sender: Arc<dyn EventSender>,
    disabled: Arc<AtomicBool>,
    interval: std::time::Duration,
) {
    let _ = sender.send_diagnostic(manager.init_event()).await;
    let mut timer = tokio::time::interval(interval);
    timer.tick().await;
    loop {
        timer.tick().await;
        if disabled.load(Ordering::Relaxed) {
            break;
        }
        let _ = sender.send_diagnostic(manager.periodic_event()).await;
    }
}
