//! HTTP client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthProvider, Credentials};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
use crate::middleware::{Middleware, Transport};
use crate::retry::{RetryConfig, RetryStrategy};
use crate::settings::Environment;

/// HTTP client configuration.
///
/// Immutable once handed to [`HttpClient::new`](crate::HttpClient::new);
/// per-request options never write back into it.
#[derive(Clone)]
pub struct HttpClientConfig {
    /// Deployment environment, reported in client logs.
    pub environment: Environment,
    /// Base URL joined with relative request targets.
    pub base_url: Option<String>,
    /// Default per-call timeout, covering every attempt; zero disables it.
    pub timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// How long idle pooled connections are kept.
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per host.
    pub pool_max_idle_per_host: usize,
    /// Default headers for all requests; caller headers win.
    pub default_headers: Vec<(String, String)>,
    /// User agent string.
    pub user_agent: String,
    /// Follow redirects.
    pub follow_redirects: bool,
    /// Maximum redirects to follow.
    pub max_redirects: usize,
    /// Whether requests are retried by default.
    pub retry_enabled: bool,
    /// Default retry configuration.
    pub retry: RetryConfig,
    /// Custom default retry strategy, replacing the one built from `retry`.
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    /// Whether requests go through the circuit breaker by default.
    pub breaker_enabled: bool,
    /// Configuration of per-host breakers.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Shared breaker map, replacing a client-owned one.
    pub breaker_manager: Option<Arc<CircuitBreakerManager>>,
    /// Default auth provider.
    pub auth: Option<Arc<dyn AuthProvider>>,
    /// Credentials used to pick a default provider when `auth` is unset.
    pub credentials: Credentials,
    /// Caller middlewares; each one wraps the ones before it.
    pub middlewares: Vec<Arc<dyn Middleware>>,
    /// Custom base transport, replacing the reqwest one.
    pub transport: Option<Arc<dyn Transport>>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            base_url: None,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 100,
            default_headers: Vec::new(),
            user_agent: format!("httpc/{}", env!("CARGO_PKG_VERSION")),
            follow_redirects: true,
            max_redirects: 10,
            retry_enabled: true,
            retry: RetryConfig::default(),
            retry_strategy: None,
            breaker_enabled: false,
            circuit_breaker: CircuitBreakerConfig::default(),
            breaker_manager: None,
            auth: None,
            credentials: Credentials::default(),
            middlewares: Vec::new(),
            transport: None,
        }
    }
}

impl HttpClientConfig {
    /// Create a new configuration builder.
    pub fn builder() -> HttpClientConfigBuilder {
        HttpClientConfigBuilder::default()
    }
}

impl fmt::Debug for HttpClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientConfig")
            .field("environment", &self.environment)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("pool_idle_timeout", &self.pool_idle_timeout)
            .field("pool_max_idle_per_host", &self.pool_max_idle_per_host)
            .field("default_headers", &self.default_headers)
            .field("user_agent", &self.user_agent)
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("retry_enabled", &self.retry_enabled)
            .field("retry", &self.retry)
            .field("custom_retry_strategy", &self.retry_strategy.is_some())
            .field("breaker_enabled", &self.breaker_enabled)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("auth", &self.auth.as_ref().map(|a| a.name()))
            .field("middlewares", &self.middlewares.len())
            .field("custom_transport", &self.transport.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for HTTP client configuration.
///
/// Setters apply in call order; a later call overrides an earlier one.
#[derive(Debug, Default)]
pub struct HttpClientConfigBuilder {
    config: HttpClientConfig,
}

impl HttpClientConfigBuilder {
    /// Set the deployment environment.
    pub fn environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    /// Set the base URL for all requests.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    /// Set the default request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the connection pool idle timeout.
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    /// Set the maximum idle connections per host.
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.config.pool_max_idle_per_host = max;
        self
    }

    /// Add a default header for all requests.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_headers.push((name.into(), value.into()));
        self
    }

    /// Set the user agent string.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Enable or disable following redirects.
    pub fn follow_redirects(mut self, enable: bool) -> Self {
        self.config.follow_redirects = enable;
        self
    }

    /// Set the maximum number of redirects to follow.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.config.max_redirects = max;
        self
    }

    /// Set and enable the retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self.config.retry_enabled = true;
        self
    }

    /// Enable or disable retries by default.
    pub fn retry_enabled(mut self, enable: bool) -> Self {
        self.config.retry_enabled = enable;
        self
    }

    /// Set the maximum number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    /// Use a custom default retry strategy.
    pub fn retry_strategy(mut self, strategy: impl RetryStrategy + 'static) -> Self {
        self.config.retry_strategy = Some(Arc::new(strategy));
        self.config.retry_enabled = true;
        self
    }

    /// Disable retries by default.
    pub fn no_retry(self) -> Self {
        self.retry_enabled(false)
    }

    /// Set and enable the circuit breaker configuration.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self.config.breaker_enabled = true;
        self
    }

    /// Enable or disable the circuit breaker by default.
    pub fn breaker_enabled(mut self, enable: bool) -> Self {
        self.config.breaker_enabled = enable;
        self
    }

    /// Share a breaker map with other clients.
    pub fn breaker_manager(mut self, manager: Arc<CircuitBreakerManager>) -> Self {
        self.config.breaker_manager = Some(manager);
        self
    }

    /// Set the default auth provider.
    pub fn auth(mut self, provider: impl AuthProvider + 'static) -> Self {
        self.config.auth = Some(Arc::new(provider));
        self
    }

    /// Set credentials to pick the default auth provider from.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.config.credentials = credentials;
        self
    }

    /// Append a middleware; it wraps every middleware added before it.
    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.config.middlewares.push(Arc::new(middleware));
        self
    }

    /// Replace the base transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.config.transport = Some(Arc::new(transport));
        self
    }

    /// Build the configuration.
    pub fn build(self) -> HttpClientConfig {
        self.config
    }
}
