//! Periodic diagnostic events: SDK and host information plus pipeline
//! counters. Never contains context or user data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::now_millis;

/// One streaming-connection attempt, reported in periodic diagnostics.
#[derive(Debug, Clone)]
pub struct StreamInit {
    /// When the attempt began, epoch milliseconds.
    pub timestamp: u64,
    /// Whether the attempt failed before delivering data.
    pub failed: bool,
    /// How long establishing the connection took.
    pub duration_millis: u64,
}

/// Counters accumulated between periodic diagnostic events. Shared with the
/// pipeline worker (drops, dedups, batch sizes) and the streaming data
/// source (connection attempts).
#[derive(Debug, Default)]
pub struct DiagnosticCounters {
    dropped_events: AtomicU64,
    deduplicated_contexts: AtomicU64,
    events_in_last_batch: AtomicU64,
    stream_inits: Mutex<Vec<StreamInit>>,
}

impl DiagnosticCounters {
    pub fn record_stream_init(&self, init: StreamInit) {
        if let Ok(mut inits) = self.stream_inits.lock() {
            inits.push(init);
        }
    }

    pub(crate) fn record_dropped_events(&self, count: u64) {
        self.dropped_events.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_deduplicated_context(&self) {
        self.deduplicated_contexts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, events: u64) {
        self.events_in_last_batch.store(events, Ordering::Relaxed);
    }

    fn drain(&self) -> (u64, u64, u64, Vec<StreamInit>) {
        let dropped = self.dropped_events.swap(0, Ordering::Relaxed);
        let deduplicated = self.deduplicated_contexts.swap(0, Ordering::Relaxed);
        let last_batch = self.events_in_last_batch.load(Ordering::Relaxed);
        let inits = self
            .stream_inits
            .lock()
            .map(|mut inits| std::mem::take(&mut *inits))
            .unwrap_or_default();
        (dropped, deduplicated, last_batch, inits)
    }
}

/// Builds the diagnostic `init` and periodic events for one client instance.
pub struct DiagnosticsManager {
    id: Value,
    configuration: Value,
    counters: Arc<DiagnosticCounters>,
    data_since: AtomicU64,
}

impl DiagnosticsManager {
    /// `configuration` is a JSON object describing the client's (sanitized)
    /// settings; it must not contain the SDK key.
    pub fn new(sdk_key: &str, configuration: Value) -> Self {
        let suffix: String = {
            let chars: Vec<char> = sdk_key.chars().collect();
            chars[chars.len().saturating_sub(6)..].iter().collect()
        };
        Self {
            id: json!({
                "diagnosticId": Uuid::new_v4().to_string(),
                "sdkKeySuffix": suffix,
            }),
            configuration,
            counters: Arc::new(DiagnosticCounters::default()),
            data_since: AtomicU64::new(now_millis()),
        }
    }

    /// The shared counters; hand a clone to whatever records into them.
    pub fn counters(&self) -> Arc<DiagnosticCounters> {
        Arc::clone(&self.counters)
    }

    pub(crate) fn init_event(&self) -> Value {
        json!({
            "kind": "diagnostic-init",
            "creationDate": now_millis(),
            "id": self.id,
            "sdk": {
                "name": "flagstream-rust-sdk",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "platform": {
                "name": "rust",
                "osName": std::env::consts::OS,
                "osArch": std::env::consts::ARCH,
            },
            "configuration": self.configuration,
        })
    }

    pub(crate) fn periodic_event(&self) -> Value {
        let now = now_millis();
        let (dropped, deduplicated, last_batch, inits) = self.counters.drain();
        let data_since = self.data_since.swap(now, Ordering::Relaxed);
        json!({
            "kind": "diagnostic",
            "creationDate": now,
            "id": self.id,
            "dataSinceDate": data_since,
            "droppedEvents": dropped,
            "deduplicatedUsers": deduplicated,
            "eventsInLastBatch": last_batch,
            "streamInits": inits
                .iter()
                .map(|init| json!({
                    "timestamp": init.timestamp,
                    "failed": init.failed,
                    "durationMillis": init.duration_millis,
                }))
                .collect::<Vec<_>>(),
        })
    }
}
