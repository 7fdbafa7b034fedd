//! The default in-memory data store.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{DataKind, DataStore, FullDataSet, StoreItem};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    data: FullDataSet,
    initialized: bool,
}

/// In-memory [`DataStore`].
///
/// A single `RwLock` guards the dataset, so every read observes one
/// consistent snapshot and an `init` never tears a concurrent read. Item
/// payloads are `Arc`ed, which keeps the clone in `get`/`all` cheap.
#[derive(Default)]
pub struct MemoryDataStore {
    inner: RwLock<Inner>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        // Lock poisoning can only happen if a writer panicked, and no code
        // path here panics while holding the lock; recover the guard.
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl DataStore for MemoryDataStore {
    fn init(&self, data: FullDataSet) -> Result<()> {
        let mut inner = self.write();
        inner.data = data;
        inner.initialized = true;
        Ok(())
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
        Ok(self
            .read()
            .data
            .get(&kind)
            .and_then(|items| items.get(key))
            .cloned())
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
        Ok(self.read().data.get(&kind).cloned().unwrap_or_default())
    }

    fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<bool> {
        let mut inner = self.write();
        let items = inner.data.entry(kind).or_default();
        let applied = match items.get(key) {
            Some(existing) => item.version() > existing.version(),
            None => true,
        };
        if applied {
            items.insert(key.to_string(), item);
        }
        Ok(applied)
    }

    fn is_initialized(&self) -> bool {
        self.read().initialized
    }
}
