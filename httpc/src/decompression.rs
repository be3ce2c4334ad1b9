//! Transparent gzip/deflate response decoding.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use futures::StreamExt;
use futures::stream;
use http::HeaderValue;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, HeaderMap};
use std::io::{self, Write};
use tracing::debug;

use crate::context::CallContext;
use crate::middleware::{Middleware, Next};
use crate::request::WireRequest;
use crate::response::{BodyStream, WireResponse};
use crate::{HttpClientError, Result};

/// Encodings advertised when the caller declares none.
pub const ACCEPTED_ENCODINGS: &str = "gzip, deflate";

/// Content encodings this middleware decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// `gzip` / `x-gzip`.
    Gzip,
    /// `deflate`, zlib-wrapped or raw.
    Deflate,
}

impl Encoding {
    /// Read the response's `Content-Encoding`; `None` for identity or
    /// anything not decodable here.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(CONTENT_ENCODING)?.to_str().ok()?;
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" => Some(Self::Deflate),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

enum Inner {
    Gzip(GzDecoder<Vec<u8>>),
    Zlib(ZlibDecoder<Vec<u8>>),
    Raw(DeflateDecoder<Vec<u8>>),
}

impl Inner {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Gzip(d) => d.write_all(data),
            Self::Zlib(d) => d.write_all(data),
            Self::Raw(d) => d.write_all(data),
        }
    }

    fn take_output(&mut self) -> Bytes {
        let out = match self {
            Self::Gzip(d) => d.get_mut(),
            Self::Zlib(d) => d.get_mut(),
            Self::Raw(d) => d.get_mut(),
        };
        Bytes::from(std::mem::take(out))
    }

    fn finish(self) -> io::Result<Bytes> {
        let out = match self {
            Self::Gzip(d) => d.finish()?,
            Self::Zlib(d) => d.finish()?,
            Self::Raw(d) => d.finish()?,
        };
        Ok(Bytes::from(out))
    }
}

/// Incremental decoder fed with body chunks.
///
/// A `deflate` body is sniffed on its first two bytes: a valid zlib header
/// selects the zlib decoder, anything else raw DEFLATE.
pub struct StreamDecoder {
    encoding: Encoding,
    inner: Option<Inner>,
    pending: Vec<u8>,
}

impl StreamDecoder {
    /// Create a decoder for `encoding`.
    pub fn new(encoding: Encoding) -> Self {
        let inner = match encoding {
            Encoding::Gzip => Some(Inner::Gzip(GzDecoder::new(Vec::new()))),
            Encoding::Deflate => None,
        };
        Self {
            encoding,
            inner,
            pending: Vec::new(),
        }
    }

    /// Encoding being decoded.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Feed a chunk, returning whatever decoded output is ready.
    pub fn write(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        if let Some(inner) = self.inner.as_mut() {
            inner.write_all(chunk)?;
            return Ok(inner.take_output());
        }

        self.pending.extend_from_slice(chunk);
        if self.pending.len() < 2 {
            return Ok(Bytes::new());
        }
        let zlib = is_zlib_header(self.pending[0], self.pending[1]);
        self.start_deflate(zlib)
    }

    /// Flush the decoder at end of input.
    pub fn finish(mut self) -> io::Result<Bytes> {
        let head = match self.inner {
            Some(_) => Bytes::new(),
            None if self.pending.is_empty() => return Ok(Bytes::new()),
            None => self.start_deflate(false)?,
        };
        let tail = match self.inner {
            Some(inner) => inner.finish()?,
            None => Bytes::new(),
        };
        Ok([head, tail].concat().into())
    }

    fn start_deflate(&mut self, zlib: bool) -> io::Result<Bytes> {
        let mut inner = if zlib {
            Inner::Zlib(ZlibDecoder::new(Vec::new()))
        } else {
            Inner::Raw(DeflateDecoder::new(Vec::new()))
        };
        inner.write_all(&std::mem::take(&mut self.pending))?;
        let out = inner.take_output();
        self.inner = Some(inner);
        Ok(out)
    }
}

fn is_zlib_header(cmf: u8, flg: u8) -> bool {
    cmf & 0x0F == 8 && (u16::from(cmf) << 8 | u16::from(flg)) % 31 == 0
}

fn decode_error(encoding: Encoding, error: io::Error) -> HttpClientError {
    HttpClientError::Decompression(format!("{}: {error}", encoding.as_str()))
}

/// Wrap `body` so it yields decoded bytes. On a decode error the source
/// stream is dropped and the error is the last item.
pub fn decode_stream(body: BodyStream, encoding: Encoding) -> BodyStream {
    let state = Some((body, StreamDecoder::new(encoding), false));
    Box::pin(stream::unfold(state, move |state| async move {
        let Some((mut body, mut decoder, mut seen_input)) = state else {
            return None;
        };
        loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    seen_input |= !chunk.is_empty();
                    match decoder.write(&chunk) {
                        Ok(out) if out.is_empty() => continue,
                        Ok(out) => return Some((Ok(out), Some((body, decoder, seen_input)))),
                        Err(e) => return Some((Err(decode_error(encoding, e)), None)),
                    }
                }
                Some(Err(e)) => return Some((Err(e), None)),
                None if !seen_input => return None,
                None => {
                    return match decoder.finish() {
                        Ok(out) if out.is_empty() => None,
                        Ok(out) => Some((Ok(out), None)),
                        Err(e) => Some((Err(decode_error(encoding, e)), None)),
                    };
                }
            }
        }
    }))
}

/// Middleware advertising and decoding gzip/deflate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DecompressionMiddleware;

impl DecompressionMiddleware {
    /// Create a decompression middleware.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for DecompressionMiddleware {
    async fn handle(
        &self,
        mut request: WireRequest,
        ctx: &CallContext,
        next: Next<'_>,
    ) -> Result<WireResponse> {
        if !request.headers().contains_key(ACCEPT_ENCODING) {
            request
                .headers_mut()
                .insert(ACCEPT_ENCODING, HeaderValue::from_static(ACCEPTED_ENCODINGS));
        }

        let mut response = next.run(request, ctx).await?;
        let Some(encoding) = Encoding::from_headers(response.headers()) else {
            return Ok(response);
        };

        debug!(
            encoding = encoding.as_str(),
            url = %response.url(),
            "Decompressing HTTP response body"
        );
        response.headers_mut().remove(CONTENT_ENCODING);
        response.headers_mut().remove(CONTENT_LENGTH);
        Ok(response.map_body(|body| decode_stream(body, encoding)))
    }
}
