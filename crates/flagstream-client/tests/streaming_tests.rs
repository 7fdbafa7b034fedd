//! Streaming data source tests against a mock event-stream service.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use flagstream_client::{
    Client, Config, Context, DataSourceMode, DataSourceState, ServiceEndpoints,
};

fn sse_body(events: &[(&str, serde_json::Value)]) -> String {
    events
        .iter()
        .map(|(event, data)| format!("event: {event}\ndata: {data}\n\n"))
        .collect()
}

fn flag_json(key: &str, version: u64, on: bool) -> serde_json::Value {
    json!({
        "key": key, "version": version, "on": on,
        "variations": [false, true],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "salt": "s",
    })
}

async fn client_for(server: &MockServer) -> Client {
    let config = Config::builder("sdk-test-key")
        .endpoints(ServiceEndpoints {
            streaming_base: server.uri(),
            polling_base: server.uri(),
            events_base: server.uri(),
        })
        .data_source(DataSourceMode::Streaming {
            initial_reconnect_delay: Duration::from_millis(50),
        })
        .events(false)
        .start_wait(Duration::from_secs(5))
        .build()
        .unwrap();
    Client::new(config).await.unwrap()
}

#[tokio::test]
async fn put_initializes_and_serves_flags() {
    let server = MockServer::start().await;
    let body = sse_body(&[(
        "put",
        json!({"path": "/", "data": {
            "flags": {
                "flag-a": flag_json("flag-a", 1, true),
                "flag-b": flag_json("flag-b", 1, false),
            },
            "segments": {},
        }}),
    )]);
    Mock::given(method("GET"))
        .and(path("/all"))
        .and(header_exists("Authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    assert!(client.is_initialized());

    let context = Context::builder("u1").build().unwrap();
    assert!(client.bool_variation(&context, "flag-a", false));
    assert!(!client.bool_variation(&context, "flag-b", true));
    client.close().await;
}

#[tokio::test]
async fn patch_respects_version_ordering() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        (
            "put",
            json!({"path": "/", "data": {
                "flags": {"flag-a": flag_json("flag-a", 5, true)},
                "segments": {},
            }}),
        ),
        // Same version: ignored.
        ("patch", json!({"path": "/flags/flag-a", "data": flag_json("flag-a", 5, false)})),
        // Higher version: applied (turns the flag off).
        ("patch", json!({"path": "/flags/flag-a", "data": flag_json("flag-a", 6, false)})),
    ]);
    // Serve the stream once; reconnect attempts get an unrecoverable 404,
    // so the dataset stays exactly as the patches left it.
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let context = Context::builder("u1").build().unwrap();

    // Wait for the patches to land: the flag ends up off (serving false).
    let mut value = true;
    for _ in 0..100 {
        value = client.bool_variation(&context, "flag-a", true);
        if !value {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!value, "patch with higher version was not applied");

    let detail = client.bool_variation_detail(&context, "flag-a", true);
    assert_eq!(detail.reason, flagstream_client::Reason::off());
    client.close().await;
}

#[tokio::test]
async fn delete_tombstones_flag() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        (
            "put",
            json!({"path": "/", "data": {
                "flags": {"flag-a": flag_json("flag-a", 1, true)},
                "segments": {},
            }}),
        ),
        ("delete", json!({"path": "/flags/flag-a", "version": 2})),
    ]);
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let context = Context::builder("u1").build().unwrap();

    let mut detail = client.bool_variation_detail(&context, "flag-a", false);
    for _ in 0..100 {
        detail = client.bool_variation_detail(&context, "flag-a", false);
        if detail.reason == flagstream_client::Reason::error(flagstream_client::ErrorKind::FlagNotFound)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        detail.reason,
        flagstream_client::Reason::error(flagstream_client::ErrorKind::FlagNotFound)
    );
    client.close().await;
}

#[tokio::test]
async fn stream_drop_reports_interrupted_then_recovers() {
    let server = MockServer::start().await;
    let body = sse_body(&[(
        "put",
        json!({"path": "/", "data": {"flags": {}, "segments": {}}}),
    )]);
    // Every connection serves one put and then ends; the source reconnects.
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let client = client_for(&server).await;
    let provider = client.data_source_status_provider();
    assert!(client.is_initialized());

    // The stream ends shortly after connecting; we should observe an
    // interruption and then a return to Valid on the next reconnect.
    let saw_interrupted = provider
        .wait_for(DataSourceState::Interrupted, Duration::from_secs(5))
        .await;
    assert!(saw_interrupted);
    let recovered = provider
        .wait_for(DataSourceState::Valid, Duration::from_secs(5))
        .await;
    assert!(recovered);
    client.close().await;
}

#[tokio::test]
async fn unauthorized_stream_shuts_the_source_off() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let config = Config::builder("sdk-bad-key")
        .endpoints(ServiceEndpoints {
            streaming_base: server.uri(),
            polling_base: server.uri(),
            events_base: server.uri(),
        })
        .events(false)
        .start_wait(Duration::from_millis(500))
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    assert!(!client.is_initialized());
    let status = client.data_source_status_provider().current();
    assert_eq!(status.state, DataSourceState::Off);
    let error = status.last_error.unwrap();
    assert_eq!(error.status_code, Some(401));

    // Evaluations still work, returning defaults.
    let context = Context::builder("u").build().unwrap();
    let detail = client.bool_variation_detail(&context, "anything", true);
    assert!(detail.value);
    client.close().await;
}

#[tokio::test]
async fn malformed_stream_data_causes_reconnect() {
    let server = MockServer::start().await;
    let garbage = "event: put\ndata: {not json at all\n\n";
    Mock::given(method("GET"))
        .and(path("/all"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(garbage, "text/event-stream"))
        .expect(2..)
        .mount(&server)
        .await;

    let config = Config::builder("sdk-test-key")
        .endpoints(ServiceEndpoints {
            streaming_base: server.uri(),
            polling_base: server.uri(),
            events_base: server.uri(),
        })
        .data_source(DataSourceMode::Streaming {
            initial_reconnect_delay: Duration::from_millis(20),
        })
        .events(false)
        .start_wait(Duration::from_millis(400))
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();
    // Never initializes, but keeps retrying (observed via expect(2..)).
    assert!(!client.is_initialized());
    client.close().await;
}
