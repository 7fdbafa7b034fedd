//! Context-key deduplication for index events.

use std::num::NonZeroUsize;

use lru::LruCache;

/// Remembers which context keys have been announced with an index event in
/// the current deduplication window. The cache is bounded; evicting a key
/// merely means that context may be indexed again, which the service
/// tolerates.
pub(crate) struct ContextKeyDeduplicator {
    cache: LruCache<String, ()>,
}

impl ContextKeyDeduplicator {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Record the key; returns whether it was already known this window.
    pub(crate) fn note(&mut self, key: &str) -> bool {
        if self.cache.contains(key) {
            self.cache.promote(key);
            return true;
        }
        self.cache.put(key.to_string(), ());
        false
    }

    /// Start a new window: every context becomes unseen again.
    pub(crate) fn reset(&mut self) {
        self.cache.clear();
    }
}
