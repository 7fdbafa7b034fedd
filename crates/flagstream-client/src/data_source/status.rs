//! The observable connection-state machine shared by all data sources.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Connection states of the data source.
///
/// `Initializing → Valid ⇄ Interrupted`, with `Off` terminal. A failure
/// before the first `Valid` keeps the state at `Initializing`; `Interrupted`
/// is only ever reported after data has been received once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceState {
    Initializing,
    Valid,
    Interrupted,
    Off,
}

/// Classification of a data-source failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceErrorKind {
    Unknown,
    NetworkError,
    ErrorResponse,
    InvalidData,
    StoreError,
}

/// Details of the most recent failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceErrorInfo {
    pub kind: DataSourceErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// A point-in-time status snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// When the current state was entered.
    pub state_since: DateTime<Utc>,
    pub last_error: Option<DataSourceErrorInfo>,
}

/// Publishes status transitions to any number of subscribers and backs
/// [`DataSourceStatusProvider::wait_for`].
pub struct DataSourceStatusProvider {
    sender: watch::Sender<DataSourceStatus>,
}

impl Default for DataSourceStatusProvider {
    fn default() -> Self {
        let initial = DataSourceStatus {
            state: DataSourceState::Initializing,
            state_since: Utc::now(),
            last_error: None,
        };
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }
}

impl DataSourceStatusProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current status.
    pub fn current(&self) -> DataSourceStatus {
        self.sender.borrow().clone()
    }

    /// Subscribe to status changes. The receiver immediately holds the
    /// current status.
    pub fn subscribe(&self) -> watch::Receiver<DataSourceStatus> {
        self.sender.subscribe()
    }

    /// Record a state transition, applying the machine's rules:
    /// `Interrupted` before the first `Valid` stays `Initializing`, and
    /// `Off` is terminal.
    pub(crate) fn update(&self, state: DataSourceState, error: Option<DataSourceErrorInfo>) {
        self.sender.send_modify(|status| {
            if status.state == DataSourceState::Off {
                return;
            }
            let effective = match (state, status.state) {
                (DataSourceState::Interrupted, DataSourceState::Initializing) => {
                    DataSourceState::Initializing
                }
                (next, _) => next,
            };
            if effective != status.state {
                status.state = effective;
                status.state_since = Utc::now();
            }
            if let Some(error) = error {
                status.last_error = Some(error);
            }
        });
    }

    /// Wait until the source reaches `desired`, the timeout elapses, or the
    /// source shuts down. Returns whether the desired state was reached.
    pub async fn wait_for(&self, desired: DataSourceState, timeout: Duration) -> bool {
        let mut receiver = self.subscribe();
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                {
                    let status = receiver.borrow_and_update();
                    if status.state == desired {
                        return true;
                    }
                    // Off is terminal: the desired state can never arrive.
                    if status.state == DataSourceState::Off {
                        return false;
                    }
                }
                if receiver.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        outcome.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(kind: DataSourceErrorKind) -> DataSourceErrorInfo {
        DataSourceErrorInfo {
            kind,
            status_code: None,
            message: "boom".to_string(),
            time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn interrupted_before_valid_stays_initializing() {
        let provider = DataSourceStatusProvider::new();
        provider.update(
            DataSourceState::Interrupted,
            Some(error(DataSourceErrorKind::NetworkError)),
        );
        let status = provider.current();
        assert_eq!(status.state, DataSourceState::Initializing);
        // The error is still recorded.
        assert_eq!(
            status.last_error.unwrap().kind,
            DataSourceErrorKind::NetworkError
        );
    }

    #[tokio::test]
    async fn interrupted_after_valid_is_reported() {
        let provider = DataSourceStatusProvider::new();
        provider.update(DataSourceState::Valid, None);
        provider.update(DataSourceState::Interrupted, None);
        assert_eq!(provider.current().state, DataSourceState::Interrupted);
    }

    #[tokio::test]
    async fn off_is_terminal() {
        let provider = DataSourceStatusProvider::new();
        provider.update(DataSourceState::Off, None);
        provider.update(DataSourceState::Valid, None);
        assert_eq!(provider.current().state, DataSourceState::Off);
    }

    #[tokio::test]
    async fn wait_for_sees_transition() {
        let provider = std::sync::Arc::new(DataSourceStatusProvider::new());
        let waiter = {
            let provider = provider.clone();
            tokio::spawn(async move {
                provider
                    .wait_for(DataSourceState::Valid, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        provider.update(DataSourceState::Valid, None);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_returns_early_on_off() {
        let provider = std::sync::Arc::new(DataSourceStatusProvider::new());
        let waiter = {
            let provider = provider.clone();
            tokio::spawn(async move {
                provider
                    .wait_for(DataSourceState::Valid, Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        provider.update(DataSourceState::Off, None);
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let provider = DataSourceStatusProvider::new();
        assert!(
            !provider
                .wait_for(DataSourceState::Valid, Duration::from_millis(30))
                .await
        );
    }

    #[tokio::test]
    async fn state_since_only_moves_on_change() {
        let provider = DataSourceStatusProvider::new();
        provider.update(DataSourceState::Valid, None);
        let first = provider.current().state_since;
        provider.update(DataSourceState::Valid, None);
        assert_eq!(provider.current().state_since, first);
    }
}
