//! The caching façade over a [`PersistentDataStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use lru::LruCache;

use flagstream_core::error::Result;
use flagstream_core::model::codec::{deserialize_item, serialize_item};
use flagstream_core::store::{DataKind, DataStore, FullDataSet, StoreItem};

use super::{CacheMode, DataStoreStatus, DataStoreStatusProvider, PersistentDataStore};

const OUTAGE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Cache hit/miss/error counters, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub load_errors: u64,
}

struct CachedEntry {
    item: Option<StoreItem>,
    inserted: Instant,
}

/// Implements [`DataStore`] on top of a persistent backend.
///
/// Reads go through an LRU cache according to the configured [`CacheMode`];
/// writes go through to the backend and update the cache. When the backend
/// errors, the wrapper reports itself unavailable and polls until a probe
/// succeeds, then notifies status listeners; with an infinite-TTL cache,
/// writes accumulated during the outage are replayed into the backend on
/// recovery.
pub struct PersistentStoreWrapper {
    backend: Arc<dyn PersistentDataStore>,
    mode: CacheMode,
    items: Mutex<LruCache<(DataKind, String), CachedEntry>>,
    collections: Mutex<HashMap<DataKind, (Instant, HashMap<String, StoreItem>)>>,
    initialized: AtomicBool,
    status: Arc<DataStoreStatusProvider>,
    poller_running: AtomicBool,
    self_ref: Weak<PersistentStoreWrapper>,
    hits: AtomicU64,
    misses: AtomicU64,
    load_errors: AtomicU64,
}

impl PersistentStoreWrapper {
    pub fn new(backend: Arc<dyn PersistentDataStore>, mode: CacheMode) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            backend,
            mode,
            items: Mutex::new(LruCache::unbounded()),
            collections: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            status: Arc::new(DataStoreStatusProvider::default()),
            poller_running: AtomicBool::new(false),
            self_ref: self_ref.clone(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            load_errors: AtomicU64::new(0),
        })
    }

    pub fn status_provider(&self) -> Arc<DataStoreStatusProvider> {
        Arc::clone(&self.status)
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            load_errors: self.load_errors.load(Ordering::Relaxed),
        }
    }

    fn is_fresh(&self, inserted: Instant) -> bool {
        match self.mode {
            CacheMode::Disabled => false,
            CacheMode::Ttl(ttl) => inserted.elapsed() < ttl,
            CacheMode::Infinite => true,
        }
    }

    fn cache_put(&self, kind: DataKind, key: &str, item: Option<StoreItem>) {
        if !self.mode.is_enabled() {
            return;
        }
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.put(
            (kind, key.to_string()),
            CachedEntry {
                item,
                inserted: Instant::now(),
            },
        );
    }

    fn cache_evict(&self, kind: DataKind, key: &str) {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items.pop(&(kind, key.to_string()));
    }

    fn collections_evict(&self, kind: DataKind) {
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        collections.remove(&kind);
    }

    /// Mark the backend unavailable and start the recovery poller (once).
    fn on_backend_error(&self) {
        self.load_errors.fetch_add(1, Ordering::Relaxed);
        self.status.update(DataStoreStatus {
            available: false,
            stale: false,
        });
        if self.poller_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(wrapper) = self.self_ref.upgrade() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                loop {
                    tokio::time::sleep(OUTAGE_POLL_INTERVAL).await;
                    if wrapper.backend.is_available() {
                        wrapper.on_recovery();
                        break;
                    }
                }
                wrapper.poller_running.store(false, Ordering::SeqCst);
            });
        } else {
            self.poller_running.store(false, Ordering::SeqCst);
            tracing::warn!("persistent store unavailable and no runtime for outage polling");
        }
    }

    fn on_recovery(&self) {
        tracing::info!("persistent store became available again");
        let mut replay_failed = false;
        if self.mode.is_infinite() {
            // The cache kept accepting writes during the outage; push them
            // back into the backend so other processes catch up.
            let entries: Vec<((DataKind, String), Option<StoreItem>)> = {
                let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
                items
                    .iter()
                    .map(|(key, entry)| (key.clone(), entry.item.clone()))
                    .collect()
            };
            for ((kind, key), item) in entries {
                let Some(item) = item else { continue };
                let serialized = match serialize_item(&item) {
                    Ok(serialized) => serialized,
                    Err(_) => continue,
                };
                if self.backend.upsert(kind, &key, &serialized).is_err() {
                    replay_failed = true;
                    break;
                }
            }
        }
        self.status.update(DataStoreStatus {
            available: true,
            // With a non-infinite cache (or a failed replay) the backend may
            // have missed writes; the data source should refresh.
            stale: !self.mode.is_infinite() || replay_failed,
        });
    }

    fn refresh_caches(&self, data: &FullDataSet) {
        if !self.mode.is_enabled() {
            return;
        }
        {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            items.clear();
            for (kind, collection) in data {
                for (key, item) in collection {
                    items.put(
                        (*kind, key.clone()),
                        CachedEntry {
                            item: Some(item.clone()),
                            inserted: Instant::now(),
                        },
                    );
                }
            }
        }
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        collections.clear();
        for (kind, collection) in data {
            collections.insert(*kind, (Instant::now(), collection.clone()));
        }
    }
}

impl DataStore for PersistentStoreWrapper {
    fn init(&self, data: FullDataSet) -> Result<()> {
        let mut serialized = Vec::new();
        for (kind, items) in &data {
            let mut collection = Vec::new();
            for (key, item) in items {
                collection.push((key.clone(), serialize_item(item)?));
            }
            serialized.push((*kind, collection));
        }
        match self.backend.init(serialized) {
            Ok(()) => {
                self.initialized.store(true, Ordering::Relaxed);
                self.refresh_caches(&data);
                self.status.update(DataStoreStatus {
                    available: true,
                    stale: false,
                });
                Ok(())
            }
            Err(error) => {
                if self.mode.is_infinite() {
                    // Reads keep working from cache through the outage.
                    self.initialized.store(true, Ordering::Relaxed);
                    self.refresh_caches(&data);
                }
                self.on_backend_error();
                Err(error)
            }
        }
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
        if self.mode.is_enabled() {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = items.get(&(kind, key.to_string())) {
                if self.is_fresh(entry.inserted) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.item.clone());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.backend.get(kind, key) {
            Ok(serialized) => {
                let item = match serialized {
                    Some(serialized) => Some(deserialize_item(kind, &serialized.serialized)?),
                    None => None,
                };
                self.cache_put(kind, key, item.clone());
                Ok(item)
            }
            Err(error) => {
                self.on_backend_error();
                Err(error)
            }
        }
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
        if self.mode.is_enabled() {
            let collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((inserted, items)) = collections.get(&kind) {
                if self.is_fresh(*inserted) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(items.clone());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.backend.get_all(kind) {
            Ok(serialized) => {
                let mut items = HashMap::new();
                for (key, item) in serialized {
                    items.insert(key, deserialize_item(kind, &item.serialized)?);
                }
                if self.mode.is_enabled() {
                    let mut collections =
                        self.collections.lock().unwrap_or_else(|e| e.into_inner());
                    collections.insert(kind, (Instant::now(), items.clone()));
                }
                Ok(items)
            }
            Err(error) => {
                self.on_backend_error();
                Err(error)
            }
        }
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<bool> {
        let serialized = serialize_item(&item)?;
        match self.backend.upsert(kind, key, &serialized) {
            Ok(applied) => {
                if applied {
                    self.cache_put(kind, key, Some(item));
                }
                self.collections_evict(kind);
                Ok(applied)
            }
            Err(error) => {
                if self.mode.is_infinite() {
                    // Keep serving (and later replay) the newest value.
                    self.cache_put(kind, key, Some(item));
                } else {
                    // Consistency preferred: do not pretend the write stuck.
                    self.cache_evict(kind, key);
                }
                self.collections_evict(kind);
                self.on_backend_error();
                Err(error)
            }
        }
    }

    fn is_initialized(&self) -> bool {
        if self.initialized.load(Ordering::Relaxed) {
            return true;
        }
        let inited = self.backend.is_initialized();
        if inited {
            self.initialized.store(true, Ordering::Relaxed);
        }
        inited
    }
}
