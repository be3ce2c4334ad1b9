//! Regenerable request bodies.
//!
//! A request body is modelled as a factory rather than a buffer: every call
//! produces a fresh, byte-identical copy of the payload. The retry middleware
//! relies on this to rebuild the body of each attempt from scratch.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use crate::{HttpClientError, Result};

/// Content type applied to JSON bodies.
pub const JSON: &str = "application/json";
/// Content type applied to text bodies.
pub const TEXT: &str = "text/plain; charset=utf-8";
/// Content type applied to raw byte bodies.
pub const OCTET_STREAM: &str = "application/octet-stream";
/// Content type applied to url-encoded form bodies.
pub const FORM: &str = "application/x-www-form-urlencoded";

/// One materialization of a request body.
#[derive(Debug, Clone)]
pub struct BodyContent {
    /// Payload bytes.
    pub data: Bytes,
    /// Default content type, used when the request sets none.
    pub content_type: Option<String>,
}

impl BodyContent {
    /// Create body content with a default content type.
    pub fn new(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            content_type: Some(content_type.into()),
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

type ProduceFn = dyn Fn() -> Result<BodyContent> + Send + Sync;

/// Re-callable body factory.
///
/// Cloning shares the underlying factory. Every invocation must yield the
/// same bytes.
#[derive(Clone)]
pub struct BodyFactory {
    produce: Arc<ProduceFn>,
}

impl BodyFactory {
    /// Wrap a closure as a body factory.
    pub fn new<F>(produce: F) -> Self
    where
        F: Fn() -> Result<BodyContent> + Send + Sync + 'static,
    {
        Self {
            produce: Arc::new(produce),
        }
    }

    /// Produce a fresh copy of the body.
    pub fn produce(&self) -> Result<BodyContent> {
        (self.produce)()
    }

    /// Raw bytes with an explicit content type.
    pub fn raw(data: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        let content = BodyContent::new(data, content_type);
        Self::new(move || Ok(content.clone()))
    }

    /// UTF-8 text.
    pub fn text(text: impl Into<String>) -> Self {
        Self::raw(text.into().into_bytes(), TEXT)
    }

    /// JSON-serialized value.
    ///
    /// Serialization failures are reported each time the factory runs, so
    /// they surface as build errors of the call.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => Self::raw(bytes, JSON),
            Err(e) => Self::failing(format!("serialize json body: {e}")),
        }
    }

    /// `application/x-www-form-urlencoded` body.
    pub fn form<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_urlencoded::to_string(value) {
            Ok(encoded) => Self::raw(encoded.into_bytes(), FORM),
            Err(e) => Self::failing(format!("encode form body: {e}")),
        }
    }

    /// Body read from a seekable source.
    ///
    /// Each call rewinds the source to its start and reads it to the end.
    pub fn reader<R>(reader: R) -> Self
    where
        R: Read + Seek + Send + 'static,
    {
        let reader = Mutex::new(reader);
        Self::new(move || {
            let mut reader = reader.lock();
            reader
                .seek(SeekFrom::Start(0))
                .map_err(|e| HttpClientError::RequestBuild(format!("rewind body: {e}")))?;
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .map_err(|e| HttpClientError::RequestBuild(format!("read body: {e}")))?;
            Ok(BodyContent::new(data, OCTET_STREAM))
        })
    }

    /// `multipart/form-data` body.
    pub fn multipart(form: Multipart) -> Self {
        let content_type = form.content_type();
        let encoded = form.encode();
        Self::raw(encoded, content_type)
    }

    fn failing(message: String) -> Self {
        Self::new(move || Err(HttpClientError::RequestBuild(message.clone())))
    }
}

impl fmt::Debug for BodyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyFactory").finish_non_exhaustive()
    }
}

/// A file part of a multipart body.
#[derive(Debug, Clone)]
pub struct MultipartFile {
    /// Form field name.
    pub field_name: String,
    /// File name; only the final path component is sent.
    pub file_name: String,
    /// File contents.
    pub content: Bytes,
    /// Part content type. When unset it is guessed from the file name,
    /// falling back to `application/octet-stream`.
    pub content_type: Option<String>,
}

impl MultipartFile {
    /// Create a file part.
    pub fn new(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            file_name: file_name.into(),
            content: content.into(),
            content_type: None,
        }
    }

    /// Set the part content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Builder for `multipart/form-data` payloads.
///
/// The boundary is chosen once, so every encoding of the same form is
/// byte-identical.
#[derive(Debug, Clone)]
pub struct Multipart {
    boundary: String,
    fields: Vec<(String, String)>,
    files: Vec<MultipartFile>,
}

impl Multipart {
    /// Create an empty form with a random boundary.
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let boundary: String = (0..30)
            .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
            .collect();
        Self {
            boundary,
            fields: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Add a text field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    /// Add a file part.
    pub fn file(mut self, file: MultipartFile) -> Self {
        self.files.push(file);
        self
    }

    /// The form boundary.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// The `Content-Type` header value for this form.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.fields {
            self.part_header(&mut out);
            out.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    escape_quotes(name)
                )
                .as_bytes(),
            );
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for file in &self.files {
            let file_name = Path::new(&file.file_name)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&file.file_name);
            self.part_header(&mut out);
            out.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    escape_quotes(&file.field_name),
                    escape_quotes(file_name)
                )
                .as_bytes(),
            );
            let content_type = file
                .content_type
                .clone()
                .unwrap_or_else(|| guess_content_type(file_name));
            out.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
            out.extend_from_slice(&file.content);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        out
    }

    fn part_header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(format!("--{}\r\n", self.boundary).as_bytes());
    }
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

fn guess_content_type(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

fn escape_quotes(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
