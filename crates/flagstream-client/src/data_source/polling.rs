//! The polling data source: periodic full-dataset fetches with HTTP caching.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use tokio::task::JoinHandle;

use flagstream_core::model::codec;

use super::status::{
    DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatusProvider,
};
use super::{is_http_error_recoverable, UpdateSink};
use crate::http::HttpProperties;

/// Fetches `GET /sdk/latest-all` on a fixed interval. A 304 (via ETag) or a
/// byte-identical 200 leaves the store untouched, so unchanged datasets
/// never cause store rewrites or spurious change events.
pub struct PollingDataSource {
    url: String,
    http: HttpProperties,
    sink: Arc<UpdateSink>,
    status: Arc<DataSourceStatusProvider>,
    interval: Duration,
}

impl PollingDataSource {
    pub(crate) fn new(
        polling_base: &str,
        payload_filter: Option<&str>,
        http: HttpProperties,
        sink: Arc<UpdateSink>,
        status: Arc<DataSourceStatusProvider>,
        interval: Duration,
    ) -> Self {
        let url = crate::http::with_filter(
            format!("{}/sdk/latest-all", polling_base.trim_end_matches('/')),
            payload_filter,
        );
        Self {
            url,
            http,
            sink,
            status,
            interval,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let client = match self.http.client() {
            Ok(client) => client,
            Err(error) => {
                tracing::error!(%error, "cannot build polling HTTP client");
                self.status.update(DataSourceState::Off, None);
                return;
            }
        };
        let mut state = PollState::default();
        loop {
            if !self.poll_once(&client, &mut state).await {
                return;
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One poll. Returns false when polling should stop for good.
    async fn poll_once(&self, client: &reqwest::Client, state: &mut PollState) -> bool {
        let mut request = client.get(&self.url).headers(self.http.headers());
        if let Some(etag) = &state.etag {
            request = request.header(IF_NONE_MATCH, etag.clone());
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(%error, "poll request failed");
                self.status.update(
                    DataSourceState::Interrupted,
                    Some(DataSourceErrorInfo {
                        kind: DataSourceErrorKind::NetworkError,
                        status_code: None,
                        message: error.to_string(),
                        time: Utc::now(),
                    }),
                );
                return true;
            }
        };

        let status_code = response.status();
        if status_code == StatusCode::NOT_MODIFIED {
            // Cache hit: the dataset we hold is still current.
            self.status.update(DataSourceState::Valid, None);
            return true;
        }
        if !status_code.is_success() {
            let code = status_code.as_u16();
            let error = DataSourceErrorInfo {
                kind: DataSourceErrorKind::ErrorResponse,
                status_code: Some(code),
                message: format!("poll request returned HTTP {code}"),
                time: Utc::now(),
            };
            if !is_http_error_recoverable(code) {
                tracing::error!(status = code, "unrecoverable poll error; giving up");
                self.status.update(DataSourceState::Off, Some(error));
                return false;
            }
            tracing::warn!(status = code, "poll request failed; will retry");
            self.status.update(DataSourceState::Interrupted, Some(error));
            return true;
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(error) => {
                self.status.update(
                    DataSourceState::Interrupted,
                    Some(DataSourceErrorInfo {
                        kind: DataSourceErrorKind::NetworkError,
                        status_code: None,
                        message: error.to_string(),
                        time: Utc::now(),
                    }),
                );
                return true;
            }
        };

        let body_hash = {
            let mut hasher = DefaultHasher::new();
            body.hash(&mut hasher);
            hasher.finish()
        };
        if state.last_body_hash == Some(body_hash) {
            // Same payload as the last successful poll: no store rewrite.
            state.etag = etag;
            self.status.update(DataSourceState::Valid, None);
            return true;
        }

        match codec::parse_all_data(&body).and_then(|all| self.sink.init(all)) {
            Ok(()) => {
                state.etag = etag;
                state.last_body_hash = Some(body_hash);
                self.status.update(DataSourceState::Valid, None);
            }
            Err(flagstream_core::FlagstreamError::MalformedData { message }) => {
                tracing::warn!(%message, "malformed poll payload");
                self.status.update(
                    DataSourceState::Interrupted,
                    Some(DataSourceErrorInfo {
                        kind: DataSourceErrorKind::InvalidData,
                        status_code: None,
                        message,
                        time: Utc::now(),
                    }),
                );
            }
            Err(error) => {
                tracing::warn!(%error, "data store rejected poll payload");
                self.status.update(
                    DataSourceState::Interrupted,
                    Some(DataSourceErrorInfo {
                        kind: DataSourceErrorKind::StoreError,
                        status_code: None,
                        message: error.to_string(),
                        time: Utc::now(),
                    }),
                );
            }
        }
        true
    }
}

#[derive(Default)]
struct PollState {
    etag: Option<String>,
    last_body_hash: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use flagstream_core::store::{DataStore, MemoryDataStore};

    use crate::config::Config;
    use crate::flag_tracker::FlagTracker;

    fn dataset(version: u64) -> serde_json::Value {
        json!({
            "flags": {"flag-a": {
                "key": "flag-a", "version": version, "on": true,
                "variations": [false, true],
                "fallthrough": {"variation": 1}, "offVariation": 0, "salt": "s",
            }},
            "segments": {},
        })
    }

    fn source_for(
        server: &MockServer,
        store: Arc<MemoryDataStore>,
        interval: Duration,
    ) -> (PollingDataSource, Arc<DataSourceStatusProvider>) {
        let config = Config::builder("sdk-test-key").build().unwrap();
        let http = HttpProperties::from_config(&config).unwrap();
        let sink = Arc::new(UpdateSink::new(
            store as Arc<dyn DataStore>,
            Arc::new(FlagTracker::new()),
        ));
        let status = Arc::new(DataSourceStatusProvider::new());
        let source = PollingDataSource::new(
            &server.uri(),
            None,
            http,
            sink,
            Arc::clone(&status),
            interval,
        );
        (source, status)
    }

    #[tokio::test]
    async fn first_poll_initializes_store() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdk/latest-all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(dataset(1)))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryDataStore::new());
        let (source, status) = source_for(&server, Arc::clone(&store), Duration::from_secs(600));
        let handle = source.spawn();
        assert!(
            status
                .wait_for(DataSourceState::Valid, Duration::from_secs(5))
                .await
        );
        assert!(store.is_initialized());
        handle.abort();
    }

    #[tokio::test]
    async fn etag_revalidation_and_304_leave_store_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdk/latest-all"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(dataset(1))
                    .insert_header("ETag", "\"v1\""),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sdk/latest-all"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1..)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryDataStore::new());
        let (source, status) = source_for(&server, Arc::clone(&store), Duration::from_millis(50));
        let handle = source.spawn();
        assert!(
            status
                .wait_for(DataSourceState::Valid, Duration::from_secs(5))
                .await
        );
        // Let at least one revalidation happen; the expect(1..) on the 304
        // mock verifies the If-None-Match header went out.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(status.current().state, DataSourceState::Valid);
        let item = store
            .get(flagstream_core::store::DataKind::Features, "flag-a")
            .unwrap()
            .unwrap();
        assert_eq!(item.version(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn unrecoverable_status_stops_polling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdk/latest-all"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryDataStore::new());
        let (source, status) = source_for(&server, store, Duration::from_millis(20));
        let handle = source.spawn();
        assert!(
            !status
                .wait_for(DataSourceState::Valid, Duration::from_millis(500))
                .await
        );
        assert_eq!(status.current().state, DataSourceState::Off);
        assert_eq!(status.current().last_error.unwrap().status_code, Some(403));
        // expect(1) on the mock verifies no further polls happened.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
    }

    #[tokio::test]
    async fn server_errors_interrupt_and_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdk/latest-all"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sdk/latest-all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(dataset(2)))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryDataStore::new());
        let (source, status) = source_for(&server, Arc::clone(&store), Duration::from_millis(20));
        let handle = source.spawn();
        assert!(
            status
                .wait_for(DataSourceState::Valid, Duration::from_secs(5))
                .await
        );
        assert!(store.is_initialized());
        handle.abort();
    }
}
