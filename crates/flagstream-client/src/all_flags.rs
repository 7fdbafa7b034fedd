//! A snapshot of every flag's state for one context, serializable as
//! bootstrap data for client-side SDKs.

use std::collections::HashMap;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;

use flagstream_core::eval::Reason;

/// Options for [`crate::Client::all_flags_state`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFlagsOptions {
    /// Only include flags marked for client-side exposure.
    pub client_side_only: bool,
    /// Include evaluation reasons in the metadata.
    pub with_reasons: bool,
    /// Omit version/reason metadata for flags that do not require event
    /// tracking, shrinking the payload.
    pub details_only_for_tracked_flags: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct FlagState {
    pub(crate) value: Value,
    pub(crate) variation: Option<usize>,
    pub(crate) version: Option<u64>,
    pub(crate) reason: Option<Reason>,
    pub(crate) track_events: bool,
    pub(crate) debug_events_until_date: Option<u64>,
    pub(crate) omit_details: bool,
}

/// The result of evaluating every flag for one context.
///
/// Serializes to the JSON object the client-side JavaScript SDK accepts as
/// bootstrap data: flag values at the top level, per-flag metadata under
/// `$flagsState`, and a `$valid` marker. An uninitialized client produces
/// an empty-but-invalid snapshot.
#[derive(Debug, Clone)]
pub struct AllFlagsState {
    valid: bool,
    flags: HashMap<String, FlagState>,
}

impl AllFlagsState {
    pub(crate) fn new(valid: bool, flags: HashMap<String, FlagState>) -> Self {
        Self { valid, flags }
    }

    pub(crate) fn invalid() -> Self {
        Self {
            valid: false,
            flags: HashMap::new(),
        }
    }

    /// False when the snapshot was taken before the SDK had data.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The evaluated value of one flag, if present.
    pub fn value(&self, flag_key: &str) -> Option<&Value> {
        self.flags.get(flag_key).map(|state| &state.value)
    }

    /// All flag keys in the snapshot.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.flags.keys()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FlagMetadata<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a Reason>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    track_events: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug_events_until_date: Option<u64>,
}

impl Serialize for AllFlagsState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.flags.len() + 2))?;
        for (key, state) in &self.flags {
            map.serialize_entry(key, &state.value)?;
        }
        let metadata: HashMap<&String, FlagMetadata<'_>> = self
            .flags
            .iter()
            .map(|(key, state)| {
                let metadata = if state.omit_details {
                    FlagMetadata {
                        variation: state.variation,
                        version: None,
                        reason: None,
                        track_events: state.track_events,
                        debug_events_until_date: state.debug_events_until_date,
                    }
                } else {
                    FlagMetadata {
                        variation: state.variation,
                        version: state.version,
                        reason: state.reason.as_ref(),
                        track_events: state.track_events,
                        debug_events_until_date: state.debug_events_until_date,
                    }
                };
                (key, metadata)
            })
            .collect();
        map.serialize_entry("$flagsState", &metadata)?;
        map.serialize_entry("$valid", &self.valid)?;
        map.end()
    }
}
