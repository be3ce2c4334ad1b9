//! HTTP client implementation.

use http::Method;
use std::sync::Arc;
use tracing::debug;

use crate::auth::AuthProvider;
use crate::circuit_breaker::{CircuitBreakerManager, CircuitBreakerMiddleware};
use crate::context::CallContext;
use crate::decompression::DecompressionMiddleware;
use crate::middleware::{MiddlewareChain, ReqwestTransport, Transport};
use crate::request::{LogicalRequest, build_wire_request};
use crate::retry::{RetryMiddleware, RetryPolicy, RetryStrategy};
use crate::{HttpClientConfig, RequestBuilder, Response, Result};

/// HTTP client with auth, retry, circuit breaker, and decompression.
///
/// Cloning is cheap; clones share the connection pool and breaker state.
#[derive(Clone)]
pub struct HttpClient {
    config: Arc<HttpClientConfig>,
    chain: Arc<MiddlewareChain>,
    auth: Option<Arc<dyn AuthProvider>>,
    breakers: Arc<CircuitBreakerManager>,
}

impl HttpClient {
    /// Create a new HTTP client with the given configuration.
    ///
    /// Fails when the transport cannot be built or the configured
    /// credentials cannot produce an auth provider.
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let auth = match &config.auth {
            Some(provider) => Some(provider.clone()),
            None => config.credentials.provider()?,
        };

        let transport: Arc<dyn Transport> = match &config.transport {
            Some(transport) => transport.clone(),
            None => Arc::new(ReqwestTransport::from_config(&config)?),
        };

        let breakers = config
            .breaker_manager
            .clone()
            .unwrap_or_else(|| Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone())));

        let default_retry: Option<Arc<dyn RetryStrategy>> = if config.retry_enabled {
            Some(match &config.retry_strategy {
                Some(strategy) => strategy.clone(),
                None => Arc::new(RetryPolicy::new(config.retry.clone())),
            })
        } else {
            None
        };

        let mut chain = MiddlewareChain::new(transport)
            .with_middleware(DecompressionMiddleware::new())
            .with_middleware(CircuitBreakerMiddleware::new(
                breakers.clone(),
                config.breaker_enabled,
            ))
            .with_middleware(RetryMiddleware::new(default_retry));
        for middleware in &config.middlewares {
            chain = chain.wrap(middleware.clone());
        }

        debug!(
            env = ?config.environment,
            base_url = ?config.base_url,
            auth = ?auth.as_ref().map(|a| a.name()),
            retry_enabled = config.retry_enabled,
            breaker_enabled = config.breaker_enabled,
            middlewares = config.middlewares.len(),
            "HTTP client created"
        );

        Ok(Self {
            config: Arc::new(config),
            chain: Arc::new(chain),
            auth,
            breakers,
        })
    }

    /// Create a new HTTP client with default configuration.
    pub fn default_client() -> Result<Self> {
        Self::new(HttpClientConfig::default())
    }

    /// Get the client configuration.
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Per-host circuit breakers of this client.
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// Name of the default auth provider, if any.
    pub fn auth_name(&self) -> Option<String> {
        self.auth.as_ref().map(|a| a.name())
    }

    /// Create a GET request builder.
    pub fn get(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::GET, url.into())
    }

    /// Create a POST request builder.
    pub fn post(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::POST, url.into())
    }

    /// Create a PUT request builder.
    pub fn put(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::PUT, url.into())
    }

    /// Create a PATCH request builder.
    pub fn patch(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::PATCH, url.into())
    }

    /// Create a DELETE request builder.
    pub fn delete(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::DELETE, url.into())
    }

    /// Create a HEAD request builder.
    pub fn head(&self, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, Method::HEAD, url.into())
    }

    /// Create a request builder with a custom method.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, url.into())
    }

    /// Execute a prepared request.
    ///
    /// The call deadline (the request's timeout, else the client's) bounds
    /// every attempt and backoff wait up to the final response headers;
    /// reading the body afterwards is not bounded by it.
    pub async fn execute(&self, request: &LogicalRequest) -> Result<Response> {
        let request = request.clone();

        let ctx = CallContext::new()
            .with_timeout(request.timeout().unwrap_or(self.config.timeout))
            .with_cancellation(request.cancellation().cloned().unwrap_or_default())
            .with_retry(request.retry().cloned())
            .with_force_retry(request.force_retry())
            .with_circuit_breaker(request.circuit_breaker());
        ctx.check()?;

        let mut wire = build_wire_request(&request, &self.config)?;
        if let Some(auth) = request.auth().or(self.auth.as_ref()) {
            auth.apply(&mut wire)?;
        }

        let response = ctx.run(self.chain.execute(wire, &ctx)).await?;
        Ok(Response::new(response))
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.config)
            .field("middlewares", &self.chain.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{BasicAuth, BasicSettings, Credentials};
    use crate::request::WireRequest;
    use crate::response::WireResponse;
    use crate::HttpClientError;
    use async_trait::async_trait;
    use http::{HeaderMap, StatusCode};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<WireRequest>>,
    }

    #[async_trait]
    impl Transport for Arc<Recorder> {
        async fn send(&self, request: WireRequest) -> Result<WireResponse> {
            let url = request.url().clone();
            self.seen.lock().push(request);
            Ok(WireResponse::from_bytes(StatusCode::OK, HeaderMap::new(), url, "{}"))
        }
    }

    fn client_with(recorder: &Arc<Recorder>) -> HttpClient {
        let config = HttpClientConfig::builder()
            .base_url("https://api.example.com/v1/")
            .transport(recorder.clone())
            .build();
        HttpClient::new(config).unwrap()
    }

    #[test]
    fn test_client_with_config() {
        let config = HttpClientConfig::builder()
            .timeout(Duration::from_secs(60))
            .base_url("https://api.example.com")
            .build();

        let client = HttpClient::new(config).unwrap();
        assert_eq!(client.config().timeout, Duration::from_secs(60));
        assert_eq!(
            client.config().base_url.as_deref(),
            Some("https://api.example.com")
        );
        assert!(client.auth_name().is_none());
    }

    #[test]
    fn test_auth_selected_from_credentials() {
        let config = HttpClientConfig::builder()
            .credentials(Credentials {
                basic: BasicSettings {
                    username: "user".into(),
                    password: "pass".into(),
                },
                ..Default::default()
            })
            .build();
        let client = HttpClient::new(config).unwrap();
        assert_eq!(client.auth_name().as_deref(), Some("basic"));
    }

    #[tokio::test]
    async fn test_execute_resolves_url_and_applies_defaults() {
        let recorder = Arc::new(Recorder::default());
        let client = client_with(&recorder);

        let response = client
            .get("/users")
            .query("page", "2")
            .auth(BasicAuth::new("user", "pass"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let seen = recorder.seen.lock();
        let wire = &seen[0];
        assert_eq!(wire.url().as_str(), "https://api.example.com/v1/users?page=2");
        assert_eq!(wire.headers()["authorization"], "Basic dXNlcjpwYXNz");
        assert_eq!(wire.headers()["accept-encoding"], "gzip, deflate");
        assert!(wire.headers()["user-agent"].to_str().unwrap().starts_with("httpc/"));
    }

    #[tokio::test]
    async fn test_cancelled_token_fails_before_sending() {
        let recorder = Arc::new(Recorder::default());
        let client = client_with(&recorder);
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();

        let err = client.get("/users").cancellation(token).send().await.unwrap_err();
        assert!(matches!(err, HttpClientError::Cancelled));
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_build_error_makes_no_attempt() {
        let recorder = Arc::new(Recorder::default());
        let config = HttpClientConfig::builder().transport(recorder.clone()).build();
        let client = HttpClient::new(config).unwrap();

        let err = client.get("relative/path").send().await.unwrap_err();
        assert!(err.is_build());
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_logical_request_is_not_mutated() {
        let recorder = Arc::new(Recorder::default());
        let client = client_with(&recorder);
        let request = client.get("/users").header("x-a", "1").build();

        client.execute(&request).await.unwrap();
        client.execute(&request).await.unwrap();

        assert_eq!(request.headers().len(), 1);
        assert_eq!(recorder.seen.lock().len(), 2);
    }
}
