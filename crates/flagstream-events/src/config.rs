//! Event pipeline configuration.

use std::time::Duration;

use flagstream_core::context::AttributeRef;

/// Tunables for the event pipeline. Obtain a baseline from
/// [`EventsConfig::default`] and adjust fields as needed; the client crate's
/// configuration builder does exactly that.
#[derive(Debug, Clone)]
pub struct EventsConfig {
    /// Capacity of the input channel and of the per-flush event buffer.
    /// When either is full, further events are dropped (and the drop is
    /// logged once per outage), never blocking the caller.
    pub capacity: usize,
    /// How often accumulated events are flushed to the service.
    pub flush_interval: Duration,
    /// Size of the context-key deduplication cache for index events.
    pub context_keys_capacity: usize,
    /// How often the deduplication cache is fully reset.
    pub context_keys_flush_interval: Duration,
    /// Redact every non-identifier attribute in event contexts.
    pub all_attributes_private: bool,
    /// Attributes redacted in every event context, in addition to any the
    /// context itself marks private.
    pub private_attributes: Vec<AttributeRef>,
    /// Disable the periodic diagnostic events.
    pub diagnostic_opt_out: bool,
    /// Interval between periodic diagnostic events.
    pub diagnostic_recording_interval: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            flush_interval: Duration::from_secs(5),
            context_keys_capacity: 1_000,
            context_keys_flush_interval: Duration::from_secs(300),
            all_attributes_private: false,
            private_attributes: Vec::new(),
            diagnostic_opt_out: false,
            diagnostic_recording_interval: Duration::from_secs(900),
        }
    }
}
