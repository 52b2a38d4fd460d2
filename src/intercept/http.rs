//! Transport-neutral HTTP exchange types and the transport seam.

use serde_json::Value;
use thiserror::Error;

use crate::schema::Method;

use super::path::normalize_path;

/// Outbound request as seen by the interception hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL or bare path.
    pub url: String,
    /// Header list in send order. Names compare case-insensitively.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

/// Response as returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Header list. Names compare case-insensitively.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Request without headers or body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a JSON body and its content type.
    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = body.to_string().into_bytes();
        set_header(&mut self.headers, "content-type", "application/json");
        self
    }

    /// Normalized request path.
    pub fn path(&self) -> String {
        normalize_path(&self.url)
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Replace the body, keeping a declared `content-length` in step.
    pub fn set_body(&mut self, body: Vec<u8>) {
        sync_content_length(&mut self.headers, body.len());
        self.body = body;
    }
}

impl HttpResponse {
    /// Response without headers or body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a JSON body and its content type.
    pub fn with_json(mut self, body: &Value) -> Self {
        self.body = body.to_string().into_bytes();
        set_header(&mut self.headers, "content-type", "application/json");
        self
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Parse the body as JSON.
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Replace the body, keeping a declared `content-length` in step.
    pub fn set_body(&mut self, body: Vec<u8>) {
        sync_content_length(&mut self.headers, body.len());
        self.body = body;
    }
}

/// Failure reported by the underlying transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),
    /// Any other transport failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// The seam between a test suite's HTTP client and the network.
pub trait Transport {
    /// Send one request and return its response.
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<F> Transport for F
where
    F: Fn(HttpRequest) -> Result<HttpResponse, TransportError>,
{
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self(request)
    }
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Replace every occurrence of `name` with a single `name: value`.
pub(crate) fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value.to_string()));
}

/// Remove every occurrence of `name`; returns whether anything was removed.
pub(crate) fn remove_header(headers: &mut Vec<(String, String)>, name: &str) -> bool {
    let before = headers.len();
    headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    headers.len() != before
}

fn sync_content_length(headers: &mut [(String, String)], len: usize) {
    for (key, value) in headers.iter_mut() {
        if key.eq_ignore_ascii_case("content-length") {
            *value = len.to_string();
        }
    }
}
