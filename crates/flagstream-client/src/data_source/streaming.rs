//! The streaming data source: a long-lived server-sent-events connection
//! carrying `put`, `patch`, and `delete` messages.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::{HeaderValue, ACCEPT};
use tokio::task::JoinHandle;

use flagstream_core::model::codec;

use flagstream_events::{DiagnosticCounters, StreamInit};

use super::backoff::Backoff;
use super::status::{
    DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatusProvider,
};
use super::{is_http_error_recoverable, UpdateSink};
use crate::http::HttpProperties;

/// One decoded SSE message.
#[derive(Debug, PartialEq, Eq)]
struct SseMessage {
    event: String,
    data: String,
}

/// Incremental SSE wire-format decoder: bytes in, complete messages out.
/// Handles CRLF, comment lines, and multi-line `data:` fields.
#[derive(Default)]
struct SseDecoder {
    buffer: String,
    event: String,
    data: String,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut messages = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.data.is_empty() {
                    messages.push(SseMessage {
                        event: if self.event.is_empty() {
                            "message".to_string()
                        } else {
                            std::mem::take(&mut self.event)
                        },
                        data: self.data.trim_end_matches('\n').to_string(),
                    });
                    self.data.clear();
                }
                self.event.clear();
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = value.to_string(),
                "data" => {
                    self.data.push_str(value);
                    self.data.push('\n');
                }
                _ => {}
            }
        }
        messages
    }
}

/// Maintains the event-stream connection, applying updates through the
/// [`UpdateSink`] and reporting state transitions. Reconnects forever with
/// exponential backoff unless the service answers with an unrecoverable
/// status.
pub struct StreamingDataSource {
    url: String,
    http: HttpProperties,
    sink: Arc<UpdateSink>,
    status: Arc<DataSourceStatusProvider>,
    initial_reconnect_delay: Duration,
    diagnostics: Option<Arc<DiagnosticCounters>>,
}

impl StreamingDataSource {
    pub(crate) fn new(
        streaming_base: &str,
        payload_filter: Option<&str>,
        http: HttpProperties,
        sink: Arc<UpdateSink>,
        status: Arc<DataSourceStatusProvider>,
        initial_reconnect_delay: Duration,
        diagnostics: Option<Arc<DiagnosticCounters>>,
    ) -> Self {
        let url = crate::http::with_filter(
            format!("{}/all", streaming_base.trim_end_matches('/')),
            payload_filter,
        );
        Self {
            url,
            http,
            sink,
            status,
            initial_reconnect_delay,
            diagnostics,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let client = match self.http.streaming_client() {
            Ok(client) => client,
            Err(error) => {
                tracing::error!(%error, "cannot build streaming HTTP client");
                self.status.update(DataSourceState::Off, None);
                return;
            }
        };
        let mut backoff = Backoff::new(self.initial_reconnect_delay);
        let mut outage_logged = false;
        loop {
            let attempt_started = Instant::now();
            let response = client
                .get(&self.url)
                .headers(self.http.headers())
                .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
                .send()
                .await;
            match response {
                Ok(response) if response.status().is_success() => {
                    self.record_stream_init(attempt_started, false);
                    backoff.note_connected();
                    tracing::info!("event stream connected");
                    outage_logged = false;
                    let error = self.consume(response).await;
                    self.status.update(DataSourceState::Interrupted, Some(error));
                }
                Ok(response) => {
                    self.record_stream_init(attempt_started, true);
                    let code = response.status().as_u16();
                    let error = DataSourceErrorInfo {
                        kind: DataSourceErrorKind::ErrorResponse,
                        status_code: Some(code),
                        message: format!("stream request returned HTTP {code}"),
                        time: Utc::now(),
                    };
                    if !is_http_error_recoverable(code) {
                        tracing::error!(status = code, "unrecoverable stream error; giving up");
                        self.status.update(DataSourceState::Off, Some(error));
                        return;
                    }
                    tracing::warn!(status = code, "stream request failed; will retry");
                    self.status.update(DataSourceState::Interrupted, Some(error));
                }
                Err(error) => {
                    self.record_stream_init(attempt_started, true);
                    if !outage_logged {
                        tracing::warn!(%error, "stream connection failed; will retry");
                        outage_logged = true;
                    }
                    self.status.update(
                        DataSourceState::Interrupted,
                        Some(DataSourceErrorInfo {
                            kind: DataSourceErrorKind::NetworkError,
                            status_code: None,
                            message: error.to_string(),
                            time: Utc::now(),
                        }),
                    );
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Read the stream until it ends or a message cannot be applied.
    /// Returns the error that ended it; the caller reconnects, and the
    /// service re-sends a full `put` on the new connection.
    async fn consume(&self, response: reqwest::Response) -> DataSourceErrorInfo {
        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    for message in decoder.push(&bytes) {
                        if let Err(error) = self.dispatch(&message) {
                            return error;
                        }
                    }
                }
                Err(error) => {
                    return DataSourceErrorInfo {
                        kind: DataSourceErrorKind::NetworkError,
                        status_code: None,
                        message: error.to_string(),
                        time: Utc::now(),
                    };
                }
            }
        }
        DataSourceErrorInfo {
            kind: DataSourceErrorKind::NetworkError,
            status_code: None,
            message: "stream closed by the service".to_string(),
            time: Utc::now(),
        }
    }

    fn dispatch(&self, message: &SseMessage) -> Result<(), DataSourceErrorInfo> {
        let data = message.data.as_bytes();
        let outcome = match message.event.as_str() {
            "put" => codec::parse_put(data).and_then(|all| self.sink.init(all)),
            "patch" => codec::parse_patch(data).and_then(|patch| match patch {
                Some(patch) => self.sink.upsert(patch.kind, &patch.key, patch.item),
                None => Ok(()),
            }),
            "delete" => codec::parse_delete(data).and_then(|delete| match delete {
                Some(delete) => self.sink.upsert(
                    delete.kind,
                    &delete.key,
                    flagstream_core::store::StoreItem::Tombstone(delete.version),
                ),
                None => Ok(()),
            }),
            other => {
                tracing::debug!(event = other, "ignoring unrecognized stream event");
                Ok(())
            }
        };
        match outcome {
            Ok(()) => {
                if message.event == "put" {
                    self.status.update(DataSourceState::Valid, None);
                }
                Ok(())
            }
            Err(flagstream_core::FlagstreamError::MalformedData { message }) => {
                tracing::warn!(%message, "malformed stream data; reconnecting for a fresh put");
                Err(DataSourceErrorInfo {
                    kind: DataSourceErrorKind::InvalidData,
                    status_code: None,
                    message,
                    time: Utc::now(),
                })
            }
            Err(error) => {
                tracing::warn!(%error, "data store rejected stream update; reconnecting");
                Err(DataSourceErrorInfo {
                    kind: DataSourceErrorKind::StoreError,
                    status_code: None,
                    message: error.to_string(),
                    time: Utc::now(),
                })
            }
        }
    }

    fn record_stream_init(&self, started: Instant, failed: bool) {
        if let Some(diagnostics) = &self.diagnostics {
            diagnostics.record_stream_init(StreamInit {
                timestamp: u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0),
                failed,
                duration_millis: started.elapsed().as_millis() as u64,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_parses_complete_messages() {
        let mut decoder = SseDecoder::default();
        let messages = decoder.push(b"event: put\ndata: {\"x\":1}\n\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event, "put");
        assert_eq!(messages[0].data, "{\"x\":1}");
    }

    #[test]
    fn decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: pa").is_empty());
        assert!(decoder.push(b"tch\ndata: {\"a\"").is_empty());
        let messages = decoder.push(b":2}\n\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event, "patch");
        assert_eq!(messages[0].data, "{\"a\":2}");
    }

    #[test]
    fn decoder_joins_multi_line_data() {
        let mut decoder = SseDecoder::default();
        let messages = decoder.push(b"data: line1\ndata: line2\n\n");
        assert_eq!(messages[0].data, "line1\nline2");
        assert_eq!(messages[0].event, "message");
    }

    #[test]
    fn decoder_ignores_comments_and_crlf() {
        let mut decoder = SseDecoder::default();
        let messages = decoder.push(b": keepalive\r\nevent: put\r\ndata: {}\r\n\r\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event, "put");
        assert_eq!(messages[0].data, "{}");
    }

    #[test]
    fn decoder_emits_multiple_messages_per_chunk() {
        let mut decoder = SseDecoder::default();
        let messages = decoder.push(b"event: a\ndata: 1\n\nevent: b\ndata: 2\n\n");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].event, "a");
        assert_eq!(messages[1].event, "b");
    }
}
