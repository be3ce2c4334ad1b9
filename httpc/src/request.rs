//! Request types and builder.
//!
//! A [`LogicalRequest`] is what the caller describes: method, (possibly
//! relative) target, headers, query, body factory and per-call overrides.
//! [`build_wire_request`] turns it into a concrete [`WireRequest`] against a
//! client configuration.

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::AuthProvider;
use crate::body::{BodyFactory, Multipart};
use crate::retry::RetryStrategy;
use crate::{HttpClient, HttpClientConfig, HttpClientError, Response, Result};

/// Header carrying a caller-supplied idempotency key.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// A request as described by the caller, before URL resolution and body
/// materialization.
///
/// Cloning deep-copies headers and query parameters and shares the body
/// factory.
#[derive(Clone)]
pub struct LogicalRequest {
    method: Method,
    target: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    timeout: Option<Duration>,
    auth: Option<Arc<dyn AuthProvider>>,
    retry: Option<Arc<dyn RetryStrategy>>,
    force_retry: bool,
    circuit_breaker: Option<bool>,
    body: Option<BodyFactory>,
    content_type: Option<String>,
    accept: Option<String>,
    cancellation: Option<CancellationToken>,
    invalid: Option<String>,
}

impl LogicalRequest {
    /// Create a request for `target`.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            timeout: None,
            auth: None,
            retry: None,
            force_retry: false,
            circuit_breaker: None,
            body: None,
            content_type: None,
            accept: None,
            cancellation: None,
            invalid: None,
        }
    }

    /// Create a request from a method name, normalized to upper case.
    pub fn with_method_name(method: &str, target: impl Into<String>) -> Result<Self> {
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|e| HttpClientError::RequestBuild(format!("invalid method {method:?}: {e}")))?;
        Ok(Self::new(method, target))
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target URL, absolute or relative to the client's base URL.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Request headers set by the caller.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Query parameters appended to the resolved URL.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// Mutable query parameters.
    pub fn query_mut(&mut self) -> &mut Vec<(String, String)> {
        &mut self.query
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Per-call auth provider override.
    pub fn auth(&self) -> Option<&Arc<dyn AuthProvider>> {
        self.auth.as_ref()
    }

    /// Per-call retry strategy override.
    pub fn retry(&self) -> Option<&Arc<dyn RetryStrategy>> {
        self.retry.as_ref()
    }

    /// Whether non-idempotent methods may be retried.
    pub fn force_retry(&self) -> bool {
        self.force_retry
    }

    /// Per-call circuit breaker override.
    pub fn circuit_breaker(&self) -> Option<bool> {
        self.circuit_breaker
    }

    /// Body factory, if the request has a body.
    pub fn body(&self) -> Option<&BodyFactory> {
        self.body.as_ref()
    }

    /// Caller cancellation token.
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Set a header, replacing existing values.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => self.invalid = Some(format!("invalid header {name:?}")),
        }
    }

    /// Set the body factory.
    pub fn set_body(&mut self, body: BodyFactory) {
        self.body = Some(body);
    }

    /// Set the per-call timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Override the auth provider.
    pub fn set_auth(&mut self, provider: Arc<dyn AuthProvider>) {
        self.auth = Some(provider);
    }

    /// Override the retry strategy.
    pub fn set_retry(&mut self, strategy: Arc<dyn RetryStrategy>) {
        self.retry = Some(strategy);
    }

    /// Allow retrying regardless of method idempotency.
    pub fn set_force_retry(&mut self, force: bool) {
        self.force_retry = force;
    }

    /// Force the circuit breaker on or off.
    pub fn set_circuit_breaker(&mut self, enabled: bool) {
        self.circuit_breaker = Some(enabled);
    }

    /// Set the content type hint; wins over the body factory's default.
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    /// Set the accept hint.
    pub fn set_accept(&mut self, accept: impl Into<String>) {
        self.accept = Some(accept.into());
    }

    /// Attach a cancellation token.
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancellation = Some(token);
    }
}

impl fmt::Debug for LogicalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalRequest")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("timeout", &self.timeout)
            .field("has_body", &self.body.is_some())
            .field("force_retry", &self.force_retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .finish_non_exhaustive()
    }
}

/// A concrete request ready for the transport.
///
/// Keeps the body factory it was built from so a fresh body can be produced
/// for every retried attempt.
#[derive(Debug, Clone)]
pub struct WireRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    body_factory: Option<BodyFactory>,
    timeout: Option<Duration>,
}

impl WireRequest {
    /// Create a request without a body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            body_factory: None,
            timeout: None,
        }
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Resolved URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Mutable URL (auth providers may add query parameters).
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Materialized body of this attempt.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Transport-level timeout for this request.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Breaker key: host plus explicit port.
    pub fn host(&self) -> Option<String> {
        let host = self.url.host_str().filter(|h| !h.is_empty())?;
        Some(match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    /// Copy of this request carrying a freshly produced body.
    ///
    /// Requests without a body factory are copied as-is.
    pub fn rebuild(&self) -> Result<WireRequest> {
        let body = match &self.body_factory {
            Some(factory) => Some(
                factory
                    .produce()
                    .map_err(|e| HttpClientError::RequestBuild(format!("reset body: {e}")))?
                    .data,
            ),
            None => self.body.clone(),
        };
        Ok(WireRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body,
            body_factory: self.body_factory.clone(),
            timeout: self.timeout,
        })
    }

    pub(crate) fn into_reqwest(self) -> reqwest::Request {
        let mut request = reqwest::Request::new(self.method, self.url);
        *request.headers_mut() = self.headers;
        if let Some(body) = self.body {
            *request.body_mut() = Some(reqwest::Body::from(body));
        }
        if let Some(timeout) = self.timeout {
            *request.timeout_mut() = Some(timeout);
        }
        request
    }
}

/// Resolve `target` against an optional base URL.
///
/// Absolute targets are used verbatim; relative ones are joined to the base
/// with exactly one `/` between them.
pub fn resolve_url(base_url: Option<&str>, target: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(target) {
        return Ok(url);
    }
    let base = base_url
        .filter(|b| !b.is_empty())
        .ok_or_else(|| HttpClientError::InvalidUrl(format!("relative URL {target:?} without base URL")))?;
    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        target.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| HttpClientError::InvalidUrl(format!("{joined}: {e}")))
}

/// Build the wire request for `request` against `config`.
///
/// Headers set by the caller win over computed defaults; a missing or empty
/// `User-Agent`, `Content-Type` or `Accept` is filled in.
pub fn build_wire_request(request: &LogicalRequest, config: &HttpClientConfig) -> Result<WireRequest> {
    if let Some(invalid) = &request.invalid {
        return Err(HttpClientError::RequestBuild(invalid.clone()));
    }

    let mut url = resolve_url(config.base_url.as_deref(), &request.target)?;
    if !request.query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &request.query {
            pairs.append_pair(key, value);
        }
    }

    let mut wire = WireRequest::new(request.method.clone(), url);
    wire.timeout = request.timeout;
    wire.headers = request.headers.clone();

    let mut content_type = request.content_type.clone();
    if let Some(factory) = &request.body {
        let content = factory.produce()?;
        if content_type.is_none() {
            content_type = content.content_type;
        }
        wire.body = Some(content.data);
        wire.body_factory = Some(factory.clone());
    }

    for (name, value) in &config.default_headers {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|e| HttpClientError::RequestBuild(format!("default header {name:?}: {e}")))?;
        let value = HeaderValue::try_from(value.as_str())
            .map_err(|e| HttpClientError::RequestBuild(format!("default header value: {e}")))?;
        fill_default(&mut wire.headers, name, value);
    }

    if !config.user_agent.is_empty() {
        fill_default(&mut wire.headers, USER_AGENT, header_value(&config.user_agent)?);
    }
    if let Some(content_type) = content_type.filter(|c| !c.is_empty()) {
        fill_default(&mut wire.headers, CONTENT_TYPE, header_value(&content_type)?);
    }
    if let Some(accept) = request.accept.as_deref().filter(|a| !a.is_empty()) {
        fill_default(&mut wire.headers, ACCEPT, header_value(accept)?);
    }

    Ok(wire)
}

fn fill_default(headers: &mut HeaderMap, name: HeaderName, value: HeaderValue) {
    let missing = headers
        .get(&name)
        .map(|current| current.as_bytes().is_empty())
        .unwrap_or(true);
    if missing {
        headers.insert(name, value);
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::try_from(value)
        .map_err(|e| HttpClientError::RequestBuild(format!("invalid header value {value:?}: {e}")))
}

/// HTTP request builder.
pub struct RequestBuilder<'a> {
    client: &'a HttpClient,
    request: LogicalRequest,
}

impl<'a> RequestBuilder<'a> {
    /// Create a new request builder.
    pub(crate) fn new(client: &'a HttpClient, method: Method, url: String) -> Self {
        Self {
            client,
            request: LogicalRequest::new(method, url),
        }
    }

    /// Set a header, replacing any previous value.
    pub fn header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.request.set_header(name.as_ref(), value.as_ref());
        self
    }

    /// Merge multiple headers into the request.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.request.headers.extend(headers);
        self
    }

    /// Append a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.query.push((key.into(), value.into()));
        self
    }

    /// Append multiple query parameters.
    pub fn queries<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in params {
            self.request.query.push((k.into(), v.into()));
        }
        self
    }

    /// Set the `Accept` header hint.
    pub fn accept(mut self, accept: impl Into<String>) -> Self {
        self.request.set_accept(accept);
        self
    }

    /// Set the `Content-Type` hint for the body.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.request.set_content_type(content_type);
        self
    }

    /// Set the `Idempotency-Key` header; empty keys are ignored.
    pub fn idempotency_key(self, key: impl AsRef<str>) -> Self {
        let key = key.as_ref();
        if key.is_empty() {
            return self;
        }
        self.header(IDEMPOTENCY_KEY, key)
    }

    /// Set a regenerable body.
    pub fn body_factory(mut self, body: BodyFactory) -> Self {
        self.request.set_body(body);
        self
    }

    /// Set a raw body with its content type.
    pub fn body(self, body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        self.body_factory(BodyFactory::raw(body, content_type))
    }

    /// Set the request body as text.
    pub fn text(self, text: impl Into<String>) -> Self {
        self.body_factory(BodyFactory::text(text))
    }

    /// Set the request body as JSON; also defaults `Accept` to JSON.
    pub fn json<T: Serialize + ?Sized>(mut self, json: &T) -> Self {
        if self.request.accept.is_none() {
            self.request.set_accept(crate::body::JSON);
        }
        self.body_factory(BodyFactory::json(json))
    }

    /// Set the request body as form data.
    pub fn form<T: Serialize + ?Sized>(self, form: &T) -> Self {
        self.body_factory(BodyFactory::form(form))
    }

    /// Set a `multipart/form-data` body.
    pub fn multipart(self, form: Multipart) -> Self {
        self.body_factory(BodyFactory::multipart(form))
    }

    /// Set the body from a seekable reader, re-read on every attempt.
    pub fn reader<R>(self, reader: R) -> Self
    where
        R: std::io::Read + std::io::Seek + Send + 'static,
    {
        self.body_factory(BodyFactory::reader(reader))
    }

    /// Set a custom timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request.set_timeout(timeout);
        self
    }

    /// Use this auth provider instead of the client default.
    pub fn auth(mut self, provider: impl AuthProvider + 'static) -> Self {
        self.request.set_auth(Arc::new(provider));
        self
    }

    /// Use this retry strategy instead of the client default.
    pub fn retry(mut self, strategy: impl RetryStrategy + 'static) -> Self {
        self.request.set_retry(Arc::new(strategy));
        self
    }

    /// Retry even if the method is not idempotent.
    pub fn force_retry(mut self) -> Self {
        self.request.set_force_retry(true);
        self
    }

    /// Force the circuit breaker on or off for this request.
    pub fn circuit_breaker(mut self, enabled: bool) -> Self {
        self.request.set_circuit_breaker(enabled);
        self
    }

    /// Cancel the request when `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.request.set_cancellation(token);
        self
    }

    /// Finish building without sending.
    pub fn build(self) -> LogicalRequest {
        self.request
    }

    /// Send the request.
    pub async fn send(self) -> Result<Response> {
        self.client.execute(&self.request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &str) -> HttpClientConfig {
        HttpClientConfig::builder().base_url(base).build()
    }

    #[test]
    fn test_resolve_joins_with_single_slash() {
        for (base, target) in [
            ("https://api.example.com", "users"),
            ("https://api.example.com/", "/users"),
            ("https://api.example.com//", "//users"),
        ] {
            let url = resolve_url(Some(base), target).unwrap();
            assert_eq!(url.as_str(), "https://api.example.com/users");
        }
    }

    #[test]
    fn test_resolve_keeps_absolute_target() {
        let url = resolve_url(Some("https://api.example.com/v1"), "http://other.test/x").unwrap();
        assert_eq!(url.as_str(), "http://other.test/x");
    }

    #[test]
    fn test_resolve_relative_without_base_fails() {
        let err = resolve_url(None, "/users").unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidUrl(_)));
    }

    #[test]
    fn test_query_is_appended_to_existing() {
        let mut request = LogicalRequest::new(Method::GET, "/search?q=rust");
        request.query_mut().push(("page".into(), "2".into()));
        request.query_mut().push(("q".into(), "http".into()));

        let wire = build_wire_request(&request, &config("https://api.example.com/v1")).unwrap();
        assert_eq!(
            wire.url().as_str(),
            "https://api.example.com/v1/search?q=rust&page=2&q=http"
        );
    }

    #[test]
    fn test_explicit_content_type_wins_over_factory() {
        let mut request = LogicalRequest::new(Method::POST, "/items");
        request.set_body(BodyFactory::json(&serde_json::json!({"a": 1})));
        request.set_content_type("application/vnd.api+json");

        let wire = build_wire_request(&request, &config("https://api.example.com")).unwrap();
        assert_eq!(wire.headers()[CONTENT_TYPE], "application/vnd.api+json");
        assert_eq!(wire.body().unwrap(), &Bytes::from_static(br#"{"a":1}"#));
    }

    #[test]
    fn test_caller_header_wins_over_computed_default() {
        let mut request = LogicalRequest::new(Method::POST, "/items");
        request.set_body(BodyFactory::text("hi"));
        request.set_header("content-type", "text/x-custom");
        request.set_header("user-agent", "caller/1.0");

        let wire = build_wire_request(&request, &config("https://api.example.com")).unwrap();
        assert_eq!(wire.headers()[CONTENT_TYPE], "text/x-custom");
        assert_eq!(wire.headers()[USER_AGENT], "caller/1.0");
    }

    #[test]
    fn test_empty_accept_is_filled() {
        let mut request = LogicalRequest::new(Method::GET, "/items");
        request.set_header("accept", "");
        request.set_accept("application/json");

        let wire = build_wire_request(&request, &config("https://api.example.com")).unwrap();
        assert_eq!(wire.headers()[ACCEPT], "application/json");
    }

    #[test]
    fn test_invalid_header_is_build_error() {
        let mut request = LogicalRequest::new(Method::GET, "/items");
        request.set_header("bad header", "x");
        let err = build_wire_request(&request, &config("https://api.example.com")).unwrap_err();
        assert!(err.is_build());
    }

    #[test]
    fn test_failing_body_factory_is_build_error() {
        let mut request = LogicalRequest::new(Method::POST, "/items");
        request.set_body(BodyFactory::new(|| {
            Err(HttpClientError::RequestBuild("disk gone".into()))
        }));
        let err = build_wire_request(&request, &config("https://api.example.com")).unwrap_err();
        assert!(err.is_build());
    }

    #[test]
    fn test_rebuild_invokes_factory_again() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut request = LogicalRequest::new(Method::PUT, "/items/1");
        request.set_body(BodyFactory::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(crate::body::BodyContent::new("same", "text/plain"))
        }));

        let wire = build_wire_request(&request, &config("https://api.example.com")).unwrap();
        let retry = wire.rebuild().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(retry.body(), wire.body());
        assert_eq!(retry.headers(), wire.headers());
    }

    #[test]
    fn test_method_name_is_upper_cased() {
        let request = LogicalRequest::with_method_name("patch", "/x").unwrap();
        assert_eq!(request.method(), &Method::PATCH);
    }

    #[test]
    fn test_host_includes_explicit_port() {
        let wire = WireRequest::new(Method::GET, Url::parse("http://127.0.0.1:8080/x").unwrap());
        assert_eq!(wire.host().as_deref(), Some("127.0.0.1:8080"));
        let wire = WireRequest::new(Method::GET, Url::parse("https://api.example.com/x").unwrap());
        assert_eq!(wire.host().as_deref(), Some("api.example.com"));
    }
}
