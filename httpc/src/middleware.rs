//! Middleware chain for HTTP client.
//!
//! A [`Middleware`] has the same shape as the base [`Transport`]: it takes a
//! wire request and produces a wire response, calling [`Next::run`] to reach
//! the rest of the chain. The chain is folded around the transport once, at
//! client construction.

use async_trait::async_trait;
use http::HeaderName;
use http::HeaderValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::context::CallContext;
use crate::request::WireRequest;
use crate::response::WireResponse;
use crate::{HttpClientConfig, HttpClientError, Result};

/// Capability to send a prepared request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the response once its headers arrived.
    async fn send(&self, request: WireRequest) -> Result<WireResponse>;
}

/// Transport backed by a pooled [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Wrap an existing reqwest client.
    ///
    /// The client should not decompress bodies itself.
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a reqwest client from the pool and redirect settings.
    pub fn from_config(config: &HttpClientConfig) -> Result<Self> {
        let redirect = if config.follow_redirects {
            reqwest::redirect::Policy::limited(config.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .redirect(redirect)
            .no_gzip()
            .no_deflate()
            .build()
            .map_err(|e| HttpClientError::Config(format!("build transport: {e}")))?;
        Ok(Self::new(client))
    }

    /// Get the underlying reqwest client.
    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: WireRequest) -> Result<WireResponse> {
        let response = self.client.execute(request.into_reqwest()).await?;
        Ok(WireResponse::from_reqwest(response))
    }
}

/// Middleware trait for processing requests and responses.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Process the request and call the next middleware.
    async fn handle(
        &self,
        request: WireRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<WireResponse>;
}

/// The rest of the chain below a middleware.
///
/// `Next` is `Copy`, so a middleware may run it more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    transport: &'a dyn Transport,
}

impl<'a> Next<'a> {
    /// Continue to the next middleware, or the transport at the end.
    pub async fn run(self, request: WireRequest, ctx: &CallContext) -> Result<WireResponse> {
        match self.middlewares.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    middlewares: rest,
                    transport: self.transport,
                };
                current.handle(request, ctx, next).await
            }
            None => self.transport.send(request).await,
        }
    }
}

/// Chain of middleware handlers around a transport.
///
/// Middlewares are stored outermost first.
#[derive(Clone)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
    transport: Arc<dyn Transport>,
}

impl MiddlewareChain {
    /// Create a chain that sends straight to `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            middlewares: Vec::new(),
            transport,
        }
    }

    /// Wrap the current chain in `middleware`, which becomes outermost.
    pub fn wrap(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.insert(0, middleware);
        self
    }

    /// Wrap the current chain in `middleware`.
    pub fn with_middleware<M: Middleware + 'static>(self, middleware: M) -> Self {
        self.wrap(Arc::new(middleware))
    }

    /// Number of middlewares in the chain.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Whether the chain has no middleware.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Execute the request through the middleware chain.
    pub async fn execute(&self, request: WireRequest, ctx: &CallContext) -> Result<WireResponse> {
        let next = Next {
            middlewares: &self.middlewares,
            transport: self.transport.as_ref(),
        };
        next.run(request, ctx).await
    }
}

/// Logging middleware that logs requests and responses.
#[derive(Debug, Default, Clone)]
pub struct LoggingMiddleware {
    log_headers: bool,
}

impl LoggingMiddleware {
    /// Create a new logging middleware.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable logging of headers.
    pub fn with_headers(mut self) -> Self {
        self.log_headers = true;
        self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        request: WireRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<WireResponse> {
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(method = %method, url = %url, "Sending HTTP request");

        if self.log_headers {
            for (name, value) in request.headers() {
                if value.is_sensitive() {
                    trace!(header = %name, "Request header (redacted)");
                } else {
                    trace!(header = %name, value = ?value, "Request header");
                }
            }
        }

        let start = Instant::now();
        let result = next.run(request, ctx).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(response) => {
                debug!(
                    method = %method,
                    url = %url,
                    status = %response.status(),
                    elapsed_ms,
                    "Received HTTP response"
                );
                if self.log_headers {
                    for (name, value) in response.headers() {
                        trace!(header = %name, value = ?value, "Response header");
                    }
                }
            }
            Err(error) => {
                warn!(method = %method, url = %url, elapsed_ms, error = %error, "HTTP request failed");
            }
        }

        result
    }
}

/// Default request ID header.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request ID middleware that adds a unique ID to each request.
///
/// An ID already present on the request is kept.
#[derive(Debug, Clone)]
pub struct RequestIdMiddleware {
    header_name: HeaderName,
}

impl RequestIdMiddleware {
    /// Create a new request ID middleware.
    pub fn new() -> Self {
        Self {
            header_name: HeaderName::from_static(REQUEST_ID_HEADER),
        }
    }

    /// Create with a custom header name.
    pub fn with_header(header_name: HeaderName) -> Self {
        Self { header_name }
    }
}

impl Default for RequestIdMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for RequestIdMiddleware {
    async fn handle(
        &self,
        mut request: WireRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<WireResponse> {
        if !request.headers().contains_key(&self.header_name) {
            let request_id = uuid::Uuid::new_v4().to_string();
            let value = HeaderValue::from_str(&request_id)
                .map_err(|e| HttpClientError::RequestBuild(format!("request id: {e}")))?;
            request.headers_mut().insert(self.header_name.clone(), value);
        }
        next.run(request, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, StatusCode};
    use parking_lot::Mutex;
    use url::Url;

    /// Transport answering 200 and recording the requests it saw.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<WireRequest>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, request: WireRequest) -> Result<WireResponse> {
            let url = request.url().clone();
            self.seen.lock().push(request);
            Ok(WireResponse::from_bytes(StatusCode::OK, HeaderMap::new(), url, "ok"))
        }
    }

    /// Appends its tag to `x-trace` on the way in.
    struct Tag(&'static str);

    #[async_trait]
    impl Middleware for Tag {
        async fn handle(
            &self,
            mut request: WireRequest,
            ctx: &CallContext,
            next: Next<'_>,
        ) -> Result<WireResponse> {
            let current = request
                .headers()
                .get("x-trace")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let value = HeaderValue::from_str(&format!("{current}{}", self.0)).unwrap();
            request.headers_mut().insert("x-trace", value);
            next.run(request, ctx).await
        }
    }

    fn request() -> WireRequest {
        WireRequest::new(Method::GET, Url::parse("https://api.example.com/x").unwrap())
    }

    #[tokio::test]
    async fn test_wrapped_middleware_runs_outermost() {
        let transport = Arc::new(Recorder::default());
        let chain = MiddlewareChain::new(transport.clone())
            .with_middleware(Tag("inner,"))
            .with_middleware(Tag("outer,"));
        assert_eq!(chain.len(), 2);

        chain.execute(request(), &CallContext::new()).await.unwrap();

        let seen = transport.seen.lock();
        assert_eq!(seen[0].headers()["x-trace"], "outer,inner,");
    }

    #[tokio::test]
    async fn test_empty_chain_hits_transport() {
        let transport = Arc::new(Recorder::default());
        let chain = MiddlewareChain::new(transport.clone());
        assert!(chain.is_empty());

        let response = chain.execute(request(), &CallContext::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(transport.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_request_id_is_added_once() {
        let transport = Arc::new(Recorder::default());
        let chain = MiddlewareChain::new(transport.clone()).with_middleware(RequestIdMiddleware::new());

        chain.execute(request(), &CallContext::new()).await.unwrap();
        let mut preset = request();
        preset
            .headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from_static("caller-id"));
        chain.execute(preset, &CallContext::new()).await.unwrap();

        let seen = transport.seen.lock();
        let generated = seen[0].headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(generated).is_ok());
        assert_eq!(seen[1].headers()[REQUEST_ID_HEADER], "caller-id");
    }

    #[tokio::test]
    async fn test_logging_middleware_passes_through() {
        let transport = Arc::new(Recorder::default());
        let chain = MiddlewareChain::new(transport).with_middleware(LoggingMiddleware::new().with_headers());
        let response = chain.execute(request(), &CallContext::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
