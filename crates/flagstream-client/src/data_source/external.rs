//! The external-updates-only mode: no fetching at all.

use std::sync::Arc;

use flagstream_core::store::DataStore;

use super::status::{DataSourceState, DataSourceStatusProvider};

/// A data source that never connects anywhere. The dataset is maintained by
/// an out-of-band writer, typically another process sharing the same
/// persistent store; initialization simply reflects whether that store
/// holds data.
pub struct ExternalUpdatesDataSource {
    store: Arc<dyn DataStore>,
}

impl ExternalUpdatesDataSource {
    pub(crate) fn new(store: Arc<dyn DataStore>, status: &DataSourceStatusProvider) -> Self {
        // Nothing to connect, so there is nothing that could fail later.
        status.update(DataSourceState::Valid, None);
        Self { store }
    }

    /// Whether the shared store has received a dataset from its writer.
    pub(crate) fn is_initialized(&self) -> bool {
        self.store.is_initialized()
    }
}
