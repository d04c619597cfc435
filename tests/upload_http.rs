use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use serde_json::json;
use streamline_ingest::contract::{ByteHandle, Metadata, MockByteHandle};
use streamline_ingest::error::IngestError;
use streamline_ingest::handle::MemoryHandle;
use streamline_ingest::upload::{SendFileType, UploadHttp, UploadHttpConfig};
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
}

impl Captured {
    fn single(&self) -> (HeaderMap, Bytes) {
        let requests = self.requests.lock().unwrap();
        assert_eq!(requests.len(), 1, "expected exactly one request");
        requests[0].clone()
    }
}

async fn record(State(captured): State<Captured>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    captured.requests.lock().unwrap().push((headers, body));
    ([("x-upload-id", "42")], "stored")
}

async fn reject() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "nope")
}

/// Starts a throwaway upload server and returns its address.
async fn serve() -> (SocketAddr, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route("/upload", post(record))
        .route("/fail", post(reject))
        .with_state(captured.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, captured)
}

fn multipart_config(url: String, use_streaming: bool) -> UploadHttpConfig {
    UploadHttpConfig {
        url,
        extra_headers: HashMap::from([("x-api-key".to_string(), "secret".to_string())]),
        multipart_field_name: Some("document".into()),
        multipart_filename: Some("doc.pdf".into()),
        use_streaming,
        timeout_secs: Some(10),
        ..Default::default()
    }
}

async fn handle_with(contents: &[u8]) -> MemoryHandle {
    let handle = MemoryHandle::new();
    handle.write(contents).await.unwrap();
    handle
}

fn boundary(headers: &HeaderMap) -> String {
    let content_type = headers["content-type"].to_str().unwrap();
    content_type
        .strip_prefix("multipart/form-data; boundary=")
        .expect("multipart content type")
        .to_string()
}

async fn assert_multipart_upload(use_streaming: bool) {
    let (addr, captured) = serve().await;
    let url = format!("http://{addr}/upload");
    let processor = UploadHttp::new(multipart_config(url.clone(), use_streaming)).unwrap();
    let payload = vec![7u8; 150_000];
    let handle = handle_with(&payload).await;
    let mut metadata = Metadata::new();

    processor.execute(&mut metadata, &handle).await.unwrap();

    let (headers, body) = captured.single();
    assert_eq!(headers["x-api-key"], "secret");
    let boundary = boundary(&headers);
    let mut expected = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"document\"; filename=\"doc.pdf\"\r\nContent-Type: application/octet-stream\r\n\r\n"
    )
    .into_bytes();
    expected.extend_from_slice(&payload);
    expected.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    assert_eq!(body.to_vec(), expected);

    assert_eq!(metadata["UploadHTTP.ResponseStatusCode"], json!(200));
    assert_eq!(metadata["UploadHTTP.URL"], json!(url));
    assert!(!metadata.contains_key("UploadHTTP.ResponseBody"));
    assert_eq!(handle.contents(), payload, "contents untouched by default");
}

#[tokio::test]
async fn test_streaming_multipart_upload() {
    assert_multipart_upload(true).await;
}

#[tokio::test]
async fn test_buffered_multipart_upload() {
    assert_multipart_upload(false).await;
}

#[tokio::test]
async fn test_base64_upload_writes_response_back() {
    let (addr, captured) = serve().await;
    let config = UploadHttpConfig {
        url: format!("http://{addr}/upload"),
        send_type: SendFileType::Base64,
        base64_body_format: Some(r#"{"data":"{{.Base64Contents}}"}"#.into()),
        put_response_as_contents: true,
        write_response_to_metadata: true,
        use_streaming: true,
        ..Default::default()
    };
    let processor = UploadHttp::new(config).unwrap();
    let handle = handle_with(b"hello").await;
    let mut metadata = Metadata::new();

    processor.execute(&mut metadata, &handle).await.unwrap();

    let (_, body) = captured.single();
    assert_eq!(&body[..], br#"{"data":"aGVsbG8="}"#);
    assert_eq!(handle.contents(), b"stored");
    assert_eq!(metadata["UploadHTTP.ResponseBody"], json!("stored"));
    assert_eq!(
        metadata["UploadHTTP.ResponseHeaders"]["x-upload-id"],
        json!(["42"])
    );
}

#[tokio::test]
async fn test_non_success_status_is_an_error() {
    let (addr, _) = serve().await;
    let processor = UploadHttp::new(multipart_config(format!("http://{addr}/fail"), false)).unwrap();
    let handle = handle_with(b"payload").await;
    let mut metadata = Metadata::new();

    let err = processor.execute(&mut metadata, &handle).await.unwrap_err();

    match err {
        IngestError::UnexpectedStatus { status, body } => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(body, "nope");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(metadata.is_empty());
}

#[tokio::test]
async fn test_unreachable_server_fails_without_hanging() {
    let processor = UploadHttp::new(multipart_config("http://127.0.0.1:1/upload".into(), true)).unwrap();
    let handle = handle_with(&vec![1u8; 1_000_000]).await;
    let mut metadata = Metadata::new();

    let result = tokio::time::timeout(
        Duration::from_secs(15),
        processor.execute(&mut metadata, &handle),
    )
    .await
    .expect("upload must not hang");
    assert!(matches!(result, Err(IngestError::Http(_))));
}

/// Yields `remaining` bytes of payload, then fails.
struct FailingReader {
    remaining: usize,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::InvalidData, "disk read failed")));
        }
        let n = self.remaining.min(buf.remaining()).min(8192);
        buf.put_slice(&vec![3u8; n]);
        self.remaining -= n;
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_streaming_upload_with_failing_source_errors_without_hanging() {
    let (addr, captured) = serve().await;
    let processor = UploadHttp::new(multipart_config(format!("http://{addr}/upload"), true)).unwrap();
    let mut handle = MockByteHandle::new();
    handle
        .expect_reader()
        .times(1)
        .returning(|| Ok(Box::new(FailingReader { remaining: 200_000 }) as Box<dyn AsyncRead + Send + Unpin>));
    let mut metadata = Metadata::new();

    let result = tokio::time::timeout(
        Duration::from_secs(15),
        processor.execute(&mut metadata, &handle),
    )
    .await
    .expect("upload must not hang when the source fails");

    assert!(result.is_err(), "truncated upload reported as success");
    assert!(metadata.is_empty());
    assert!(captured.requests.lock().unwrap().is_empty(), "server never saw a complete body");
}

#[test]
fn test_config_validation_and_defaults() {
    let missing_field = UploadHttpConfig {
        url: "http://localhost/upload".into(),
        ..Default::default()
    };
    assert!(matches!(missing_field.validate(), Err(IngestError::Config(_))));

    let missing_format = UploadHttpConfig {
        url: "http://localhost/upload".into(),
        send_type: SendFileType::Base64,
        ..Default::default()
    };
    assert!(missing_format.validate().is_err());

    let config = UploadHttpConfig {
        url: "http://localhost/upload".into(),
        multipart_field_name: Some("file".into()),
        ..Default::default()
    };
    config.validate().unwrap();
    let part = config.multipart_part();
    assert_eq!(part.filename, "file");
    assert_eq!(part.content_type, "application/octet-stream");
}
