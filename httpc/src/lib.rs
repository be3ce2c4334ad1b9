//! # httpc
//!
//! An outbound HTTP client pipeline: requests are built from a logical
//! description, authenticated, and sent through a chain of middlewares
//! handling retries, per-host circuit breaking, and response decompression.
//!
//! ## Features
//!
//! - **Retry with Backoff**: exponential backoff with jitter, idempotent methods only unless forced
//! - **Circuit Breaker**: one breaker per host, with a single half-open trial
//! - **Regenerable Bodies**: every retried attempt gets a freshly produced body
//! - **Auth Providers**: API key, basic, and JWT (HS256/RS256) out of the box
//! - **Decompression**: transparent gzip/deflate decoding
//! - **Middlewares**: wrap the pipeline with your own logic
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use httpc::{HttpClient, HttpClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = HttpClient::new(HttpClientConfig::default())?;
//!
//!     let response = client
//!         .get("https://api.example.com/users")
//!         .send()
//!         .await?;
//!
//!     println!("Status: {}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! ## With Retry, Circuit Breaker and Auth
//!
//! ```rust,no_run
//! use httpc::{BasicAuth, CircuitBreakerConfig, HttpClient, HttpClientConfig, RetryConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HttpClientConfig::builder()
//!         .base_url("https://api.example.com")
//!         .timeout(Duration::from_secs(30))
//!         .retry(RetryConfig::exponential(3, Duration::from_millis(100)))
//!         .circuit_breaker(CircuitBreakerConfig::default())
//!         .auth(BasicAuth::new("demo", "hunter2"))
//!         .build();
//!
//!     let client = HttpClient::new(config)?;
//!
//!     // POST is not idempotent: opt in to retries explicitly.
//!     let response = client
//!         .post("/orders")
//!         .json(&serde_json::json!({"item": "widget", "quantity": 5}))
//!         .idempotency_key("order-42")
//!         .force_retry()
//!         .send()
//!         .await?;
//!
//!     let order: serde_json::Value = response.json().await?;
//!     println!("{order}");
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod body;
pub mod circuit_breaker;
mod client;
mod config;
pub mod context;
pub mod decompression;
mod error;
pub mod middleware;
pub mod request;
pub mod response;
pub mod retry;
pub mod settings;

pub use auth::{
    ApiKeyAuth, ApiKeyLocation, AuthProvider, BasicAuth, Credentials, JwtAlgorithm, JwtAuth,
    JwtOptions,
};
pub use body::{BodyContent, BodyFactory, Multipart, MultipartFile};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState,
};
pub use client::HttpClient;
pub use config::{HttpClientConfig, HttpClientConfigBuilder};
pub use context::CallContext;
pub use error::{AuthError, HttpClientError, Result};
pub use middleware::{
    LoggingMiddleware, Middleware, MiddlewareChain, Next, RequestIdMiddleware, ReqwestTransport,
    Transport,
};
pub use request::{LogicalRequest, RequestBuilder, WireRequest};
pub use response::{Response, WireResponse};
pub use retry::{AttemptOutcome, RetryConfig, RetryPolicy, RetryStrategy};
pub use settings::{ClientSettings, Environment};

// Re-export common types
pub use bytes::Bytes;
pub use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
pub use tokio_util::sync::CancellationToken;
pub use url::Url;

/// Prelude for common imports.
///
/// ```
/// use httpc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::auth::{ApiKeyAuth, ApiKeyLocation, AuthProvider, BasicAuth, JwtAuth};
    pub use crate::body::BodyFactory;
    pub use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    pub use crate::client::HttpClient;
    pub use crate::config::{HttpClientConfig, HttpClientConfigBuilder};
    pub use crate::error::{HttpClientError, Result};
    pub use crate::middleware::{Middleware, Next};
    pub use crate::request::RequestBuilder;
    pub use crate::response::Response;
    pub use crate::retry::{RetryConfig, RetryPolicy, RetryStrategy};
    pub use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
}
