//! End-to-end client tests: URL assembly, headers, bodies, decompression and
//! middlewares.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use httpc::context::CallContext;
use httpc::{
    ClientSettings, HeaderValue, HttpClient, HttpClientConfig, HttpClientError, LoggingMiddleware,
    Middleware, Multipart, MultipartFile, Next, RequestIdMiddleware, RetryConfig, StatusCode,
    WireRequest, WireResponse,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpClient {
    let config = HttpClientConfig::builder()
        .base_url(format!("{}/api/", server.uri()))
        .default_header("x-tenant", "acme")
        .build();
    HttpClient::new(config).unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn test_base_url_and_default_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .and(header("x-tenant", "acme"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let response = client(&server).get("/users").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received[0].headers["accept-encoding"], "gzip, deflate");
    assert!(
        received[0].headers["user-agent"]
            .to_str()
            .unwrap()
            .starts_with("httpc/")
    );
}

#[tokio::test]
async fn test_caller_header_wins_over_default() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-tenant", "globex"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .get("/users")
        .header("x-tenant", "globex")
        .send()
        .await
        .unwrap();
}

#[tokio::test]
async fn test_gzip_body_is_decompressed() {
    let server = MockServer::start().await;
    let payload = serde_json::json!({"items": ["a", "b", "c"], "total": 3});
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "gzip")
                .insert_header("content-type", "application/json")
                .set_body_bytes(gzip(payload.to_string().as_bytes())),
        )
        .mount(&server)
        .await;

    let response = client(&server).get("/items").send().await.unwrap();

    assert!(response.header("content-encoding").is_none());
    assert!(response.content_length().is_none());
    assert_eq!(response.content_type(), Some("application/json"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, payload);
}

#[tokio::test]
async fn test_deflate_body_is_decompressed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "deflate")
                .set_body_bytes(zlib(b"hello deflate")),
        )
        .mount(&server)
        .await;

    let response = client(&server).get("/d").send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "hello deflate");
}

#[tokio::test]
async fn test_corrupt_gzip_surfaces_decode_error_on_read() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-encoding", "gzip")
                .set_body_bytes(b"definitely not gzip".to_vec()),
        )
        .mount(&server)
        .await;

    let response = client(&server).get("/broken").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let err = response.bytes().await.unwrap_err();
    assert!(err.is_decode());
    let err = response.text().await.unwrap_err();
    assert!(err.is_decode());
}

#[tokio::test]
async fn test_identity_body_passes_through_and_is_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain body"))
        .mount(&server)
        .await;

    let response = client(&server).get("/plain").send().await.unwrap();
    assert_eq!(response.content_length(), Some(10));

    let mut sink = Vec::new();
    let written = response.copy_to(&mut sink).await.unwrap();
    assert_eq!(written, 10);
    assert_eq!(sink, b"plain body");
    assert_eq!(response.text().await.unwrap(), "plain body");
}

#[tokio::test]
async fn test_error_status_is_a_response_not_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad input"))
        .mount(&server)
        .await;

    let response = client(&server).get("/validate").send().await.unwrap();
    assert!(response.is_client_error());

    let err = response.error_for_status().await.unwrap_err();
    assert!(matches!(
        err,
        HttpClientError::Response { status: 422, ref message } if message == "bad input"
    ));
}

#[tokio::test]
async fn test_form_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string("name=ada&lang=rust"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let response = client(&server)
        .post("/signup")
        .form(&[("name", "ada"), ("lang", "rust")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_multipart_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let form = Multipart::new()
        .field("title", "report")
        .file(MultipartFile::new("file", "/tmp/q3.csv", "a,b\n1,2\n").with_content_type("text/csv"));
    let content_type = form.content_type();

    client(&server).post("/files").multipart(form).send().await.unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received[0].headers["content-type"], content_type.as_str());
    let body = String::from_utf8(received[0].body.clone()).unwrap();
    assert!(body.contains("name=\"title\"\r\n\r\nreport\r\n"));
    assert!(body.contains("filename=\"q3.csv\"\r\nContent-Type: text/csv\r\n\r\na,b\n1,2\n"));
}

/// Appends its tag to `x-trace` and counts its invocations.
struct Tag {
    tag: &'static str,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Middleware for Tag {
    async fn handle(
        &self,
        mut request: WireRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> httpc::Result<WireResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        request
            .headers_mut()
            .append("x-trace", HeaderValue::from_static(self.tag));
        next.run(request, ctx).await
    }
}

#[tokio::test]
async fn test_later_middleware_is_outermost_and_wraps_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let config = HttpClientConfig::builder()
        .base_url(server.uri())
        .retry(RetryConfig::exponential(2, Duration::from_millis(5)))
        .middleware(Tag {
            tag: "inner",
            calls: calls.clone(),
        })
        .middleware(Tag {
            tag: "outer",
            calls: calls.clone(),
        })
        .middleware(RequestIdMiddleware::new())
        .middleware(LoggingMiddleware::new().with_headers())
        .build();

    let response = HttpClient::new(config).unwrap().get("/x").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    let request_ids: Vec<_> = received
        .iter()
        .map(|r| r.headers["x-request-id"].clone())
        .collect();
    assert_eq!(request_ids[0], request_ids[1]);
    let traces: Vec<_> = received[1]
        .headers
        .get_all("x-trace")
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(traces, vec!["outer", "inner"]);
}

#[tokio::test]
async fn test_cancellation_aborts_in_flight_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let err = client(&server)
        .get("/slow")
        .cancellation(token)
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, HttpClientError::Cancelled));
}

#[tokio::test]
async fn test_client_from_settings_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/ping"))
        .and(header("authorization", "Basic YWRtaW46czNjcjN0"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        env = "prod"
        base_url = "{}/v2"
        timeout = "2s"
        retry_max_attempts = 2

        [basic]
        username = "admin"
        password = "s3cr3t"
        "#,
        server.uri()
    )
    .unwrap();

    let settings = ClientSettings::from_file(file.path()).unwrap();
    let client = HttpClient::new(settings.into_config().build()).unwrap();
    assert_eq!(client.config().timeout, Duration::from_secs(2));

    let response = client.get("ping").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
