//! HTTP Client error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for HTTP client operations.
pub type Result<T> = std::result::Result<T, HttpClientError>;

/// HTTP client errors.
///
/// A non-2xx response is not an error: callers inspect
/// [`Response::status`](crate::Response::status) themselves, or opt in with
/// [`Response::error_for_status`](crate::Response::error_for_status).
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// Circuit breaker for the target host is open, request rejected
    /// without touching the network.
    #[error("Circuit breaker is open for {host}, request rejected")]
    CircuitOpen {
        /// Host the breaker guards.
        host: String,
    },

    /// Transport-level timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The call was cancelled by its caller.
    #[error("Request cancelled")]
    Cancelled,

    /// The call's deadline elapsed.
    #[error("Request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Request building error (bad header, failing body factory).
    #[error("Failed to build request: {0}")]
    RequestBuild(String),

    /// Authentication could not be applied.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Client construction error.
    #[error("Invalid client configuration: {0}")]
    Config(String),

    /// Response error, produced by `Response::error_for_status`.
    #[error("Response error: {status} - {message}")]
    Response {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Corrupt compressed response body.
    #[error("Failed to decompress response body: {0}")]
    Decompression(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Response body could not be read.
    #[error("Failed to read response body: {0}")]
    Body(String),

    /// Underlying HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpClientError {
    /// Check if this is a transient transport failure worth another attempt.
    ///
    /// Cancellation, breaker rejections, build, auth and decode errors are
    /// never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Check if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_)) || matches!(self, Self::Http(e) if e.is_timeout())
    }

    /// Check if this is a connection error.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_)) || matches!(self, Self::Http(e) if e.is_connect())
    }

    /// Check if the call was cancelled or ran past its deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded(_))
    }

    /// Check if this is a build error (no attempt was made).
    pub fn is_build(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl(_) | Self::RequestBuild(_) | Self::UrlParse(_)
        )
    }

    /// Check if the body could not be decoded.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decompression(_) | Self::Json(_))
    }

    /// Check if the circuit breaker rejected the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Get the HTTP status code if this is a response error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Response { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Errors raised by auth providers.
#[derive(Debug, Error)]
pub enum AuthError {
    /// API key secret is empty.
    #[error("api key is empty")]
    EmptyApiKey,

    /// API key location is neither `header` nor `query`.
    #[error("unsupported api key location: {0}")]
    UnsupportedLocation(String),

    /// Basic auth needs a username.
    #[error("username is required for basic auth")]
    MissingUsername,

    /// The selected JWT algorithm has no key material.
    #[error("{0}")]
    MissingKeyMaterial(String),

    /// JWT algorithm name not recognized.
    #[error("unsupported jwt alg {0:?}")]
    UnsupportedAlgorithm(String),

    /// Key material could not be parsed or loaded.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Token signing failed.
    #[error("sign jwt: {0}")]
    Signing(String),

    /// Credential cannot be encoded as a header name or value.
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}
