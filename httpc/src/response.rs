//! HTTP response types.
//!
//! [`WireResponse`] is what travels back up the middleware chain: status,
//! headers and a body stream that middlewares may wrap. [`Response`] is what
//! the caller gets: the same metadata plus a body read from the network at
//! most once and cached for every later accessor.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use url::Url;

use crate::{HttpClientError, Result};

/// Streaming response body.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Response as produced by a transport and seen by middlewares.
pub struct WireResponse {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: BodyStream,
}

impl WireResponse {
    /// Create a response over a body stream.
    pub fn new(status: StatusCode, headers: HeaderMap, url: Url, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            url,
            body,
        }
    }

    /// Create a response with an in-memory body.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, url: Url, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        let chunk = (!body.is_empty()).then_some(Ok(body));
        Self::new(status, headers, url, Box::pin(stream::iter(chunk)))
    }

    pub(crate) fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes_stream().map_err(HttpClientError::from);
        Self::new(status, headers, url, Box::pin(body))
    }

    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Final URL of the response.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Replace the body stream with a transformation of it.
    pub fn map_body<F>(self, f: F) -> Self
    where
        F: FnOnce(BodyStream) -> BodyStream,
    {
        Self {
            body: f(self.body),
            ..self
        }
    }
}

impl fmt::Debug for WireResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

/// Body read progress. A read interrupted by dropping its future leaves
/// `Reading` in place with the chunks buffered so far, and the next call
/// resumes from there.
enum BodyState {
    Reading { stream: BodyStream, buffered: BytesMut },
    Loaded(Bytes),
    Failed { message: String, decode: bool },
}

impl BodyState {
    fn failed(error: &HttpClientError) -> Self {
        match error {
            HttpClientError::Decompression(message) => Self::Failed {
                message: message.clone(),
                decode: true,
            },
            other => Self::Failed {
                message: other.to_string(),
                decode: false,
            },
        }
    }

    /// Pull one chunk into the buffer, settling the state at end of stream
    /// or on error. No-op outside `Reading`.
    async fn advance(&mut self) -> Result<()> {
        let Self::Reading { stream, buffered } = self else {
            return Ok(());
        };
        let next = stream.next().await;
        match next {
            Some(Ok(chunk)) => buffered.extend_from_slice(&chunk),
            Some(Err(error)) => {
                *self = Self::failed(&error);
                return Err(error);
            }
            None => {
                let bytes = std::mem::take(buffered).freeze();
                *self = Self::Loaded(bytes);
            }
        }
        Ok(())
    }
}

/// HTTP response wrapper.
///
/// A non-2xx status is not an error; inspect [`status`](Self::status) or
/// call [`error_for_status`](Self::error_for_status).
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: Mutex<BodyState>,
}

impl Response {
    /// Wrap a wire response; the body is not read yet.
    pub fn new(response: WireResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            url: response.url,
            body: Mutex::new(BodyState::Reading {
                stream: response.body,
                buffered: BytesMut::new(),
            }),
        }
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Check if the response was successful (2xx).
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response was a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Check if the response was a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Get the response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a specific header value.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
    }

    /// Get the response URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the content length if available.
    pub fn content_length(&self) -> Option<u64> {
        self.header(CONTENT_LENGTH).and_then(|v| v.parse().ok())
    }

    /// Get the content type if available.
    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE)
    }

    /// Get the response body as bytes.
    ///
    /// The first call drains the network body; later calls return the
    /// cached bytes, or the cached failure.
    pub async fn bytes(&self) -> Result<Bytes> {
        let mut state = self.body.lock().await;
        loop {
            match &*state {
                BodyState::Loaded(bytes) => return Ok(bytes.clone()),
                BodyState::Failed { message, decode } => {
                    return Err(cached_error(message, *decode));
                }
                BodyState::Reading { .. } => state.advance().await?,
            }
        }
    }

    /// Get the response body as text, decoded as UTF-8.
    pub async fn text(&self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Parse the response body as JSON.
    pub async fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = self.bytes().await?;
        if bytes.is_empty() {
            return Err(HttpClientError::Json("empty response body".to_string()));
        }
        serde_json::from_slice(&bytes).map_err(|e| HttpClientError::Json(e.to_string()))
    }

    /// Copy the body into `writer`, returning the number of bytes written.
    ///
    /// An unread body is streamed chunk by chunk and cached on the way. A
    /// failing writer leaves the body intact for later reads.
    pub async fn copy_to<W>(&self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut state = self.body.lock().await;
        let mut written = 0;
        loop {
            match &*state {
                BodyState::Loaded(bytes) => {
                    writer.write_all(&bytes[written..]).await?;
                    writer.flush().await?;
                    return Ok(bytes.len() as u64);
                }
                BodyState::Failed { message, decode } => {
                    return Err(cached_error(message, *decode));
                }
                BodyState::Reading { buffered, .. } if written < buffered.len() => {
                    writer.write_all(&buffered[written..]).await?;
                    written = buffered.len();
                }
                BodyState::Reading { .. } => state.advance().await?,
            }
        }
    }

    /// Turn a 4xx/5xx response into an error carrying the body text.
    pub async fn error_for_status(self) -> Result<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            let message = self
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(HttpClientError::Response {
                status: self.status.as_u16(),
                message,
            })
        } else {
            Ok(self)
        }
    }
}

impl From<WireResponse> for Response {
    fn from(response: WireResponse) -> Self {
        Self::new(response)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

fn cached_error(message: &str, decode: bool) -> HttpClientError {
    if decode {
        HttpClientError::Decompression(message.to_string())
    } else {
        HttpClientError::Body(message.to_string())
    }
}
