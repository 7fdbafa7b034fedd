//! # Big Segments
//!
//! Segments marked `unbounded` keep their membership in an external store
//! (typically kept in sync by a relay process) instead of inlining it in
//! flag data. This module wraps a user-supplied [`BigSegmentStore`] with a
//! per-context membership cache and a staleness poller, and adapts it to
//! the evaluator's [`BigSegmentResolver`] seam.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use flagstream_core::error::Result;
use flagstream_core::eval::{BigSegmentResolver, BigSegmentsQuery, BigSegmentsStatus};

/// Metadata reported by a big-segment store.
#[derive(Debug, Clone, Copy, Default)]
pub struct BigSegmentStoreMetadata {
    /// When the store was last synchronized with the service, epoch
    /// milliseconds. `None` when the store has never been synchronized.
    pub last_up_to_date: Option<u64>,
}

/// The interface a big-segment store integration implements.
pub trait BigSegmentStore: Send + Sync {
    /// Fetch synchronization metadata.
    fn get_metadata(&self) -> Result<BigSegmentStoreMetadata>;

    /// Fetch the membership map for one hashed context key:
    /// segment-reference → explicitly included (`true`) or excluded
    /// (`false`). `None` when the store has no record for this context.
    fn get_membership(&self, context_hash: &str) -> Result<Option<HashMap<String, bool>>>;
}

/// Tunables for the big-segment subsystem.
#[derive(Debug, Clone)]
pub struct BigSegmentsConfig {
    /// Per-context membership cache size.
    pub context_cache_size: usize,
    /// Per-context membership cache TTL.
    pub context_cache_time: Duration,
    /// How often store metadata is polled for the status report.
    pub status_poll_interval: Duration,
    /// The store counts as stale when its last sync is older than this.
    pub stale_after: Duration,
}

impl Default for BigSegmentsConfig {
    fn default() -> Self {
        Self {
            context_cache_size: 1_000,
            context_cache_time: Duration::from_secs(5),
            status_poll_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(120),
        }
    }
}

/// Observable health of the big-segment store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    pub stale: bool,
}

struct CachedMembership {
    membership: Option<HashMap<String, bool>>,
    inserted: Instant,
}

/// Decorates a [`BigSegmentStore`] with caching and status monitoring.
pub struct BigSegmentStoreWrapper {
    store: Arc<dyn BigSegmentStore>,
    config: BigSegmentsConfig,
    cache: Mutex<LruCache<String, CachedMembership>>,
    status: watch::Sender<BigSegmentStoreStatus>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl BigSegmentStoreWrapper {
    pub(crate) fn new(store: Arc<dyn BigSegmentStore>, config: BigSegmentsConfig) -> Arc<Self> {
        let capacity =
            NonZeroUsize::new(config.context_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        let (status, _) = watch::channel(BigSegmentStoreStatus {
            available: true,
            stale: false,
        });
        let wrapper = Arc::new(Self {
            store,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            status,
            poller: Mutex::new(None),
        });
        let poller = {
            let wrapper = Arc::clone(&wrapper);
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(wrapper.config.status_poll_interval);
                loop {
                    timer.tick().await;
                    wrapper.poll_status_once();
                }
            })
        };
        *wrapper.poller.lock().unwrap_or_else(|e| e.into_inner()) = Some(poller);
        wrapper
    }

    /// The current store status.
    pub fn status(&self) -> BigSegmentStoreStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<BigSegmentStoreStatus> {
        self.status.subscribe()
    }

    pub(crate) fn stop(&self) {
        if let Some(poller) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            poller.abort();
        }
    }

    fn poll_status_once(&self) {
        let status = match self.store.get_metadata() {
            Ok(metadata) => BigSegmentStoreStatus {
                available: true,
                stale: self.is_stale(metadata.last_up_to_date),
            },
            Err(error) => {
                tracing::warn!(%error, "big segment store metadata query failed");
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn is_stale(&self, last_up_to_date: Option<u64>) -> bool {
        let Some(last) = last_up_to_date else {
            return true;
        };
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        now.saturating_sub(last) > self.config.stale_after.as_millis() as u64
    }

    fn healthy_status(&self) -> BigSegmentsStatus {
        let status = self.status();
        if !status.available {
            BigSegmentsStatus::StoreError
        } else if status.stale {
            BigSegmentsStatus::Stale
        } else {
            BigSegmentsStatus::Healthy
        }
    }
}

impl BigSegmentResolver for BigSegmentStoreWrapper {
    fn query(&self, context_key: &str) -> BigSegmentsQuery {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(context_key) {
                if entry.inserted.elapsed() < self.config.context_cache_time {
                    return BigSegmentsQuery {
                        membership: entry.membership.clone(),
                        status: self.healthy_status(),
                    };
                }
            }
        }

        let context_hash = hash_context_key(context_key);
        match self.store.get_membership(&context_hash) {
            Ok(membership) => {
                let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                // Negative results are cached too: a context with no record
                // stays cheap to evaluate.
                cache.put(
                    context_key.to_string(),
                    CachedMembership {
                        membership: membership.clone(),
                        inserted: Instant::now(),
                    },
                );
                BigSegmentsQuery {
                    membership,
                    status: self.healthy_status(),
                }
            }
            Err(error) => {
                tracing::warn!(%error, "big segment membership query failed");
                BigSegmentsQuery {
                    membership: None,
                    status: BigSegmentsStatus::StoreError,
                }
            }
        }
    }
}

/// The store keys contexts by `base64(sha256(context_key))`.
fn hash_context_key(context_key: &str) -> String {
    let digest = Sha256::digest(context_key.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStore {
        metadata: Mutex<Result<BigSegmentStoreMetadata>>,
        memberships: Mutex<HashMap<String, HashMap<String, bool>>>,
        queries: Mutex<u64>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                metadata: Mutex::new(Ok(BigSegmentStoreMetadata {
                    last_up_to_date: Some(now_ms()),
                })),
                memberships: Mutex::new(HashMap::new()),
                queries: Mutex::new(0),
            }
        }
    }

    fn now_ms() -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }

    impl BigSegmentStore for FakeStore {
        fn get_metadata(&self) -> Result<BigSegmentStoreMetadata> {
            match &*self.metadata.lock().unwrap() {
                Ok(metadata) => Ok(*metadata),
                Err(_) => Err(flagstream_core::FlagstreamError::store("metadata failed")),
            }
        }

        fn get_membership(&self, context_hash: &str) -> Result<Option<HashMap<String, bool>>> {
            *self.queries.lock().unwrap() += 1;
            Ok(self.memberships.lock().unwrap().get(context_hash).cloned())
        }
    }

    #[test]
    fn context_hash_is_base64_sha256() {
        // sha256("userA") in standard base64.
        assert_eq!(
            hash_context_key("userA"),
            "tuPcD/WhlWbcpwP4SiwJvdXdIokeCbn7P8Q2xb6ez5w="
        );
    }

    #[tokio::test]
    async fn membership_queries_are_cached() {
        let store = Arc::new(FakeStore::new());
        store.memberships.lock().unwrap().insert(
            hash_context_key("u1"),
            HashMap::from([("seg.g1".to_string(), true)]),
        );
        let wrapper = BigSegmentStoreWrapper::new(store.clone(), BigSegmentsConfig::default());

        let first = wrapper.query("u1");
        assert_eq!(first.membership.as_ref().unwrap()["seg.g1"], true);
        assert_eq!(first.status, BigSegmentsStatus::Healthy);
        let _ = wrapper.query("u1");
        assert_eq!(*store.queries.lock().unwrap(), 1);

        // Unknown context: negative result, also cached.
        let missing = wrapper.query("u2");
        assert!(missing.membership.is_none());
        let _ = wrapper.query("u2");
        assert_eq!(*store.queries.lock().unwrap(), 2);

        wrapper.stop();
    }

    #[tokio::test]
    async fn stale_metadata_reported() {
        let store = Arc::new(FakeStore::new());
        *store.metadata.lock().unwrap() = Ok(BigSegmentStoreMetadata {
            last_up_to_date: Some(now_ms().saturating_sub(10 * 60 * 1000)),
        });
        let config = BigSegmentsConfig {
            status_poll_interval: Duration::from_millis(10),
            ..BigSegmentsConfig::default()
        };
        let wrapper = BigSegmentStoreWrapper::new(store, config);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(wrapper.status().stale);
        assert_eq!(wrapper.query("u").status, BigSegmentsStatus::Stale);
        wrapper.stop();
    }

    #[tokio::test]
    async fn metadata_failure_marks_unavailable() {
        let store = Arc::new(FakeStore::new());
        *store.metadata.lock().unwrap() =
            Err(flagstream_core::FlagstreamError::store("down"));
        let config = BigSegmentsConfig {
            status_poll_interval: Duration::from_millis(10),
            ..BigSegmentsConfig::default()
        };
        let wrapper = BigSegmentStoreWrapper::new(store, config);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!wrapper.status().available);
        assert_eq!(wrapper.query("u").status, BigSegmentsStatus::StoreError);
        wrapper.stop();
    }
}
