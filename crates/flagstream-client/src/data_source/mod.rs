//! # Data Sources
//!
//! The subsystems that keep the local dataset in sync with the flag
//! delivery service: a streaming (SSE) ingester with reconnect backoff, a
//! polling fallback, and an external-updates-only mode for processes that
//! share a persistent store written by someone else. All of them report
//! through the same observable state machine ([`DataSourceStatusProvider`])
//! and write through the same [`UpdateSink`].

mod backoff;
mod external;
mod polling;
mod status;
mod streaming;

pub use external::ExternalUpdatesDataSource;
pub use polling::PollingDataSource;
pub use status::{
    DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus,
    DataSourceStatusProvider,
};
pub use streaming::StreamingDataSource;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flagstream_core::error::Result;
use flagstream_core::model::codec::AllData;
use flagstream_core::store::{DataKind, DataStore, FullDataSet, StoreItem};

use crate::flag_tracker::FlagTracker;

/// Whether an HTTP error status is worth retrying. 400, 408, and 429 are
/// transient; any other 4xx means the request itself is wrong (bad SDK key,
/// wrong endpoint) and retrying cannot help. Everything else (5xx) is
/// assumed transient.
pub(crate) fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

/// The single write path from data sources into the store, keeping the
/// initialization latch and the flag tracker consistent with every write.
pub(crate) struct UpdateSink {
    store: Arc<dyn DataStore>,
    tracker: Arc<FlagTracker>,
    initialized: AtomicBool,
}

impl UpdateSink {
    pub(crate) fn new(store: Arc<dyn DataStore>, tracker: Arc<FlagTracker>) -> Self {
        Self {
            store,
            tracker,
            initialized: AtomicBool::new(false),
        }
    }

    /// Replace the full dataset.
    pub(crate) fn init(&self, data: AllData) -> Result<()> {
        let old = self.current_data()?;
        let new = data.into_data_set();
        self.store.init(new.clone())?;
        self.initialized.store(true, Ordering::Relaxed);
        self.tracker.apply_init(&old, &new);
        Ok(())
    }

    /// Apply one versioned update. Out-of-date versions are ignored without
    /// error and without notifications.
    pub(crate) fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> Result<()> {
        let applied = self.store.upsert(kind, key, item.clone())?;
        if applied {
            self.tracker.apply_upsert(kind, key, &item);
        }
        Ok(())
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed) || self.store.is_initialized()
    }

    fn current_data(&self) -> Result<FullDataSet> {
        let mut data = FullDataSet::new();
        data.insert(DataKind::Features, self.store.all(DataKind::Features)?);
        data.insert(DataKind::Segments, self.store.all(DataKind::Segments)?);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(400, true)]
    #[test_case(401, false)]
    #[test_case(403, false)]
    #[test_case(404, false)]
    #[test_case(408, true)]
    #[test_case(429, true)]
    #[test_case(499, false)]
    #[test_case(500, true)]
    #[test_case(503, true)]
    fn http_error_classification(status: u16, recoverable: bool) {
        assert_eq!(is_http_error_recoverable(status), recoverable);
    }
}
