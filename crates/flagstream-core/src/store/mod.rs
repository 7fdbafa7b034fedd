//! # Data Store Contract
//!
//! The data store is the typed, versioned local holder of flag and segment
//! data. The store owns the current dataset exclusively; the data source
//! writes into it and evaluation reads snapshots out of it. Versions are
//! monotonic per (kind, key): an upsert is applied only when its version is
//! strictly greater than the stored version, and deletions are retained as
//! versioned tombstones so that late-arriving stale updates cannot resurrect
//! an item.

mod memory;

pub use memory::MemoryDataStore;

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{Flag, Segment};

/// The two collections a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Features,
    Segments,
}

impl DataKind {
    /// Namespace string used by persistent stores and log lines.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Features => "features",
            Self::Segments => "segments",
        }
    }
}

/// A versioned item or tombstone as held by a store.
///
/// Payloads are `Arc`ed so that snapshot reads and evaluation share one
/// immutable instance with the store.
#[derive(Debug, Clone)]
pub enum StoreItem {
    Flag(Arc<Flag>),
    Segment(Arc<Segment>),
    /// A deleted item: no payload, but the version still participates in
    /// the monotonic-version rule.
    Tombstone(u64),
}

impl StoreItem {
    /// The item's version.
    pub fn version(&self) -> u64 {
        match self {
            Self::Flag(f) => f.version,
            Self::Segment(s) => s.version,
            Self::Tombstone(version) => *version,
        }
    }

    /// The flag payload, unless this is a tombstone or a segment.
    pub fn as_flag(&self) -> Option<&Arc<Flag>> {
        match self {
            Self::Flag(f) => Some(f),
            _ => None,
        }
    }

    /// The segment payload, unless this is a tombstone or a flag.
    pub fn as_segment(&self) -> Option<&Arc<Segment>> {
        match self {
            Self::Segment(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is a tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Tombstone(_))
    }
}

/// A complete dataset keyed by kind and item key, as produced by a `put` or
/// a successful poll.
pub type FullDataSet = HashMap<DataKind, HashMap<String, StoreItem>>;

/// The store contract shared by the in-memory default and persistent
/// implementations.
///
/// Implementations must be safe for concurrent use: evaluation reads from
/// many application threads while a single data source writes.
pub trait DataStore: Send + Sync {
    /// Atomically replace all contents. After the first successful `init`,
    /// [`DataStore::is_initialized`] reports true forever.
    fn init(&self, data: FullDataSet) -> Result<()>;

    /// Fetch one item. Tombstones are returned as items, not `None`; `None`
    /// means the key has never been seen.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>>;

    /// Snapshot of one collection, tombstones included.
    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>>;

    /// Insert or replace an item iff `item.version()` is strictly greater
    /// than the stored version. Returns whether the write was applied.
    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<bool>;

    /// True once any `init` has succeeded.
    fn is_initialized(&self) -> bool;
}
