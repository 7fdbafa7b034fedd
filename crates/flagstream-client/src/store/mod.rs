//! # Persistent Data Stores
//!
//! The in-memory store in `flagstream-core` is the default. For deployments
//! that share flag data across processes (Redis, DynamoDB, and the like),
//! an implementation of [`PersistentDataStore`] is wrapped by
//! [`PersistentStoreWrapper`], which adds read-through caching,
//! write-through updates, availability monitoring with an outage poller,
//! and cache statistics.

mod persistent;

pub use persistent::{CacheStats, PersistentStoreWrapper};

pub use flagstream_core::model::codec::SerializedItem;

use std::time::Duration;

use tokio::sync::watch;

use flagstream_core::error::Result;
use flagstream_core::store::DataKind;

/// Caching policy for the persistent façade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Every read goes to the backend.
    Disabled,
    /// Entries expire after the given TTL (the usual mode).
    Ttl(Duration),
    /// Entries never expire. Reads keep working from cache through a
    /// backend outage, at the cost of possibly serving stale data.
    #[default]
    Infinite,
}

impl CacheMode {
    /// A common default: 15-second TTL.
    pub fn ttl_default() -> Self {
        Self::Ttl(Duration::from_secs(15))
    }

    pub(crate) fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub(crate) fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }
}

/// The contract a database integration implements. All items cross this
/// boundary in serialized form ([`SerializedItem`]); the wrapper owns JSON
/// encoding and decoding.
pub trait PersistentDataStore: Send + Sync {
    /// Atomically (as far as the backend allows) replace all data.
    fn init(&self, data: Vec<(DataKind, Vec<(String, SerializedItem)>)>) -> Result<()>;

    /// Read one item; `None` when the key has never been written.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>>;

    /// Read one whole collection.
    fn get_all(&self, kind: DataKind) -> Result<Vec<(String, SerializedItem)>>;

    /// Versioned write; returns whether the item was applied (new version
    /// strictly greater than what the backend holds).
    fn upsert(&self, kind: DataKind, key: &str, item: &SerializedItem) -> Result<bool>;

    /// Whether the backend has ever received an `init`.
    fn is_initialized(&self) -> bool;

    /// Cheap probe used by the outage poller.
    fn is_available(&self) -> bool;
}

/// Health of a persistent store as observed by the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataStoreStatus {
    pub available: bool,
    /// Set on recovery when cached writes may not have reached the backend,
    /// so the dataset should be refreshed from the data source.
    pub stale: bool,
}

/// Publishes store status transitions.
pub struct DataStoreStatusProvider {
    sender: watch::Sender<DataStoreStatus>,
}

impl Default for DataStoreStatusProvider {
    fn default() -> Self {
        let (sender, _) = watch::channel(DataStoreStatus {
            available: true,
            stale: false,
        });
        Self { sender }
    }
}

impl DataStoreStatusProvider {
    pub fn current(&self) -> DataStoreStatus {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DataStoreStatus> {
        self.sender.subscribe()
    }

    pub(crate) fn update(&self, status: DataStoreStatus) {
        self.sender.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
