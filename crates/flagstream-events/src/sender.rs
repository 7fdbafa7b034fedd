//! HTTP delivery of event payloads.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, DATE};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

const EVENT_SCHEMA_HEADER: &str = "X-LaunchDarkly-Event-Schema";
const EVENT_SCHEMA_VERSION: &str = "4";
const PAYLOAD_ID_HEADER: &str = "X-LaunchDarkly-Payload-ID";
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Outcome of one delivery attempt (including its internal retry).
#[derive(Debug, Clone, Default)]
pub struct EventSenderResult {
    /// The payload was accepted.
    pub success: bool,
    /// The service rejected our credentials or endpoint permanently; the
    /// pipeline must disable itself.
    pub must_shutdown: bool,
    /// The service's wall-clock time from the `Date` response header, in
    /// epoch milliseconds. Used to expire debug events on server time.
    pub server_time: Option<u64>,
}

/// Delivery seam between the pipeline worker and HTTP. Swapped for an
/// in-memory recorder in tests.
#[async_trait]
pub trait EventSender: Send + Sync {
    /// POST an analytics batch. `payload_id` must be sent on every attempt
    /// for this payload so a retried POST is not double-counted.
    async fn send_analytics(&self, body: Value, payload_id: &str) -> EventSenderResult;

    /// POST one diagnostic event.
    async fn send_diagnostic(&self, body: Value) -> EventSenderResult;
}

/// The production [`EventSender`], POSTing to the events service with one
/// bounded retry.
pub struct ReqwestEventSender {
    client: reqwest::Client,
    bulk_url: String,
    diagnostic_url: String,
    default_headers: HeaderMap,
}

impl ReqwestEventSender {
    /// `base_uri` is the events service base, e.g.
    /// `https://events.launchdarkly.com`. `default_headers` carries the
    /// authorization and user-agent headers assembled by the client.
    pub fn new(client: reqwest::Client, base_uri: &str, default_headers: HeaderMap) -> Self {
        let base = base_uri.trim_end_matches('/');
        Self {
            client,
            bulk_url: format!("{base}/bulk"),
            diagnostic_url: format!("{base}/diagnostic"),
            default_headers,
        }
    }

    async fn post(&self, url: &str, body: &Value, extra_headers: &HeaderMap) -> EventSenderResult {
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
            }
            let response = self
                .client
                .post(url)
                .headers(self.default_headers.clone())
                .headers(extra_headers.clone())
                .json(body)
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return EventSenderResult {
                            success: true,
                            must_shutdown: false,
                            server_time: parse_server_date(response.headers()),
                        };
                    }
                    if is_permanent_failure(status) {
                        tracing::error!(
                            %status,
                            "event delivery rejected; disabling the event pipeline"
                        );
                        return EventSenderResult {
                            success: false,
                            must_shutdown: true,
                            server_time: None,
                        };
                    }
                    if !is_retryable(status) {
                        tracing::warn!(%status, "event payload rejected");
                        return EventSenderResult::default();
                    }
                    tracing::warn!(%status, attempt, "event delivery failed");
                }
                Err(error) => {
                    tracing::warn!(%error, attempt, "event delivery transport error");
                }
            }
        }
        EventSenderResult::default()
    }
}

#[async_trait]
impl EventSender for ReqwestEventSender {
    async fn send_analytics(&self, body: Value, payload_id: &str) -> EventSenderResult {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_SCHEMA_HEADER, HeaderValue::from_static(EVENT_SCHEMA_VERSION));
        if let Ok(value) = HeaderValue::from_str(payload_id) {
            headers.insert(PAYLOAD_ID_HEADER, value);
        }
        self.post(&self.bulk_url, &body, &headers).await
    }

    async fn send_diagnostic(&self, body: Value) -> EventSenderResult {
        self.post(&self.diagnostic_url, &body, &HeaderMap::new()).await
    }
}

fn is_permanent_failure(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND
            | StatusCode::GONE
    )
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn parse_server_date(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(DATE)?.to_str().ok()?;
    let parsed = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}
