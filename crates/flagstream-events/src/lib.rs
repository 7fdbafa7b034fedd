//! # Flagstream Events
//!
//! The analytics event pipeline of the Flagstream SDK. Evaluations,
//! identifies, and custom events are submitted from application threads
//! without blocking; a single worker task aggregates them into summary
//! counters, deduplicates context announcements, applies private-attribute
//! redaction, and hands batched payloads to an HTTP sender with bounded
//! retry. Data loss under pressure is deliberate: every queue is bounded and
//! drops rather than stalling the application.
//!
//! The entry point is [`EventProcessor`]; the client crate constructs it
//! with an [`EventsConfig`] and a [`ReqwestEventSender`].

mod config;
mod dedup;
mod diagnostics;
mod event;
mod processor;
mod redaction;
mod sender;
mod summarizer;

pub use config::EventsConfig;
pub use diagnostics::{DiagnosticCounters, DiagnosticsManager, StreamInit};
pub use event::{EvalEvent, InputEvent};
pub use processor::EventProcessor;
pub use sender::{EventSender, EventSenderResult, ReqwestEventSender};

/// Current wall-clock time in epoch milliseconds, the timestamp unit of
/// every event schema.
pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
