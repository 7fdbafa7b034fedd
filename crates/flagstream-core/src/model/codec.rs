//! Decoding of service payloads into prepared model objects, and the wire
//! form used by persistent stores.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{Flag, Segment};
use crate::error::{FlagstreamError, Result};
use crate::store::{DataKind, FullDataSet, StoreItem};

/// A full dataset as the service serializes it: `{"flags": {...},
/// "segments": {...}}`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, Flag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

impl AllData {
    /// Convert to the store's form, turning `deleted` items into tombstones.
    pub fn into_data_set(self) -> FullDataSet {
        let flags = self
            .flags
            .into_iter()
            .map(|(key, flag)| {
                let item = if flag.deleted {
                    StoreItem::Tombstone(flag.version)
                } else {
                    StoreItem::Flag(Arc::new(flag))
                };
                (key, item)
            })
            .collect();
        let segments = self
            .segments
            .into_iter()
            .map(|(key, segment)| {
                let item = if segment.deleted {
                    StoreItem::Tombstone(segment.version)
                } else {
                    StoreItem::Segment(Arc::new(segment))
                };
                (key, item)
            })
            .collect();
        let mut data = FullDataSet::new();
        data.insert(DataKind::Features, flags);
        data.insert(DataKind::Segments, segments);
        data
    }

    fn prepare(&mut self) {
        for flag in self.flags.values_mut() {
            flag.prepare();
        }
        for segment in self.segments.values_mut() {
            segment.prepare();
        }
    }
}

/// Parse and prepare a full polling payload.
pub fn parse_all_data(data: &[u8]) -> Result<AllData> {
    let mut all: AllData = serde_json::from_slice(data)?;
    all.prepare();
    Ok(all)
}

#[derive(Deserialize)]
struct PutMessage {
    #[serde(default)]
    data: AllData,
}

/// Parse a stream `put` message body and return the prepared dataset.
pub fn parse_put(data: &[u8]) -> Result<AllData> {
    let mut message: PutMessage = serde_json::from_slice(data)?;
    message.data.prepare();
    Ok(message.data)
}

#[derive(Deserialize)]
struct PatchMessage {
    path: String,
    data: serde_json::Value,
}

/// A single-item update decoded from a `patch` message.
#[derive(Debug, Clone)]
pub struct PatchData {
    pub kind: DataKind,
    pub key: String,
    pub item: StoreItem,
}

/// Parse a stream `patch` message. Returns `None` for a path this SDK does
/// not recognize, which is not an error: newer services may patch kinds we
/// do not store.
pub fn parse_patch(data: &[u8]) -> Result<Option<PatchData>> {
    let message: PatchMessage = serde_json::from_slice(data)?;
    let Some((kind, key)) = parse_path(&message.path) else {
        return Ok(None);
    };
    let item = item_from_value(kind, message.data)?;
    Ok(Some(PatchData {
        kind,
        key: key.to_string(),
        item,
    }))
}

#[derive(Deserialize)]
struct DeleteMessage {
    path: String,
    version: u64,
}

/// A deletion decoded from a `delete` message.
#[derive(Debug, Clone)]
pub struct DeleteData {
    pub kind: DataKind,
    pub key: String,
    pub version: u64,
}

/// Parse a stream `delete` message; `None` for unrecognized paths.
pub fn parse_delete(data: &[u8]) -> Result<Option<DeleteData>> {
    let message: DeleteMessage = serde_json::from_slice(data)?;
    let Some((kind, key)) = parse_path(&message.path) else {
        return Ok(None);
    };
    Ok(Some(DeleteData {
        kind,
        key: key.to_string(),
        version: message.version,
    }))
}

fn parse_path(path: &str) -> Option<(DataKind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Some((DataKind::Features, key))
    } else {
        path.strip_prefix("/segments/")
            .map(|key| (DataKind::Segments, key))
    }
}

fn item_from_value(kind: DataKind, value: serde_json::Value) -> Result<StoreItem> {
    // A patch can carry a tombstone in place of a payload.
    if value.get("deleted").and_then(|d| d.as_bool()) == Some(true) {
        let version = value
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| FlagstreamError::MalformedData {
                message: "deleted item without a version".to_string(),
            })?;
        return Ok(StoreItem::Tombstone(version));
    }
    match kind {
        DataKind::Features => {
            let mut flag: Flag = serde_json::from_value(value)?;
            flag.prepare();
            Ok(StoreItem::Flag(Arc::new(flag)))
        }
        DataKind::Segments => {
            let mut segment: Segment = serde_json::from_value(value)?;
            segment.prepare();
            Ok(StoreItem::Segment(Arc::new(segment)))
        }
    }
}

/// The wire form persistent stores hold: a version plus the serialized item.
/// Deleted items serialize as `{"version": N, "deleted": true}` for
/// compatibility with earlier store schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedItem {
    pub version: u64,
    pub serialized: String,
}

/// Serialize a store item into its persistent wire form.
pub fn serialize_item(item: &StoreItem) -> Result<SerializedItem> {
    let serialized = match item {
        StoreItem::Flag(flag) => serde_json::to_string(flag.as_ref())?,
        StoreItem::Segment(segment) => serde_json::to_string(segment.as_ref())?,
        StoreItem::Tombstone(version) => {
            format!("{{\"version\":{version},\"deleted\":true}}")
        }
    };
    Ok(SerializedItem {
        version: item.version(),
        serialized,
    })
}

/// Decode an item read back from a persistent store.
pub fn deserialize_item(kind: DataKind, serialized: &str) -> Result<StoreItem> {
    let value: serde_json::Value = serde_json::from_str(serialized)?;
    item_from_value(kind, value)
}
