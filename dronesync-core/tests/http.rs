use std::sync::{Arc, Mutex};

use dronesync_core::{
    CancelSignal, ConnectionParams, Connector, HttpConnector, HttpTransport, ProgressFn,
    Transport, TransportError,
};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn transport(server: &MockServer) -> HttpTransport {
    HttpTransport::with_base_url(&server.uri(), CancelSignal::new()).unwrap()
}

#[tokio::test]
async fn list_parses_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/files"))
        .and(query_param("path", "/Bebop/academy/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                { "name": "flight.pud", "type": "file", "size": 120, "modified": 1700000000 },
                { "name": "downloading_old.pud", "type": "file", "size": 40 },
                { "name": "sub", "type": "dir" }
            ]
        })))
        .mount(&server)
        .await;

    let entries = transport(&server).list("/Bebop/academy/").await.unwrap();

    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].name, "flight.pud");
    assert_eq!(entries[0].size, Some(120));
    assert_eq!(entries[0].modified, Some(1_700_000_000));
    assert!(entries[2].is_dir());
}

#[tokio::test]
async fn list_maps_404_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/files"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = transport(&server).list("/missing/").await.unwrap_err();
    assert!(matches!(err, TransportError::NotFound(p) if p == "/missing/"));
}

#[tokio::test]
async fn server_error_keeps_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files/rename"))
        .respond_with(ResponseTemplate::new(500).set_body_string("disk busy"))
        .mount(&server)
        .await;

    let err = transport(&server).rename("/a", "/b").await.unwrap_err();
    match err {
        TransportError::Api { status, body } => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(body, "disk busy");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn rename_and_delete_send_paths() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/files/rename"))
        .and(query_param("from", "/Bebop/academy/a.pud"))
        .and(query_param("to", "/Bebop/academy/downloading_a.pud"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/files"))
        .and(query_param("path", "/Bebop/academy/downloading_a.pud"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let transport = transport(&server);
    transport
        .rename("/Bebop/academy/a.pud", "/Bebop/academy/downloading_a.pud")
        .await
        .unwrap();
    transport
        .delete("/Bebop/academy/downloading_a.pud")
        .await
        .unwrap();
}

#[tokio::test]
async fn get_writes_full_body_and_reports_progress() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/files/content"))
        .and(query_param("path", "/a.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("nested/a.jpg");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let progress: ProgressFn = Arc::new(move |p: u8| sink.lock().unwrap().push(p));

    transport(&server)
        .get("/a.jpg", &target, false, Some(progress))
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
    assert_eq!(seen.lock().unwrap().last(), Some(&100));
}

#[tokio::test]
async fn resumed_get_sends_range_and_appends() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/files/content"))
        .and(header("range", "bytes=5-"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(b" world"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("downloading_a.jpg");
    std::fs::write(&target, b"hello").unwrap();

    transport(&server)
        .get("/downloading_a.jpg", &target, true, None)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
}

#[tokio::test]
async fn resumed_get_restarts_when_server_ignores_range() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/files/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh"))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("a.bin");
    std::fs::write(&target, b"stale-bytes").unwrap();

    transport(&server)
        .get("/a.bin", &target, true, None)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"fresh");
}

#[tokio::test]
async fn resumed_get_treats_416_as_complete_when_lengths_match() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/files/content"))
        .and(header("range", "bytes=8-"))
        .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */8"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("a.bin");
    std::fs::write(&target, b"complete").unwrap();

    transport(&server)
        .get("/a.bin", &target, true, None)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"complete");
}

#[tokio::test]
async fn resumed_get_restarts_when_local_copy_is_longer_than_remote() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/files/content"))
        .and(header("range", "bytes=12-"))
        .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */5"))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/files/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"fresh"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let target = dir.path().join("downloading_a.bin");
    std::fs::write(&target, b"stale-longer").unwrap();

    transport(&server)
        .get("/downloading_a.bin", &target, true, None)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&target).unwrap(), b"fresh");
}

#[tokio::test]
async fn canceled_signal_short_circuits_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .expect(0)
        .mount(&server)
        .await;

    let signal = CancelSignal::new();
    let transport = HttpTransport::with_base_url(&server.uri(), signal.clone()).unwrap();
    signal.cancel();

    let err = transport.list("/").await.unwrap_err();
    assert!(matches!(err, TransportError::Canceled));
}

#[tokio::test]
async fn connector_sends_basic_auth_when_credentials_given() {
    let server = MockServer::start().await;
    let address = server.address();
    Mock::given(method("GET"))
        .and(path("/api/v1/files"))
        .and(header("authorization", "Basic cGlsb3Q6c2VjcmV0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let params = ConnectionParams {
        host: address.ip().to_string(),
        port: address.port(),
        username: "pilot".into(),
        password: "secret".into(),
    };
    let transport = HttpConnector::new(params)
        .connect(CancelSignal::new())
        .await
        .unwrap();

    assert!(transport.list("/").await.unwrap().is_empty());
}
