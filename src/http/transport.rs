//! Single blocking HTTP exchange, abstracted so the retry loop can be tested
//! without a network.

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

use super::retry::NonRetryableError;

/// HTTP verbs supported by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// An already-built request descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    /// Headers in the order they are sent. Names are compared case-insensitively.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Appends a header, replacing any existing header with the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, name.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the value of the first header named `name`, ignoring case.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub(crate) fn set_header(headers: &mut Vec<(String, String)>, name: String, value: String) {
    headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
    headers.push((name, value));
}

/// A response as received from the wire. The body is not decompressed.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Performs exactly one HTTP exchange. Retrying is the caller's business.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    fn send(&self, request: &Request) -> Result<RawResponse>;
}

/// Production transport on top of `reqwest`'s blocking client.
///
/// Idle connections are never kept, so every exchange opens and closes its
/// own connection. Response bodies are handed back untouched: reqwest is
/// built without its decompression features.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .user_agent(concat!("lightfetch/", env!("LIGHTFETCH_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Wraps an existing blocking client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    #[tracing::instrument(
        skip(self, request),
        fields(method = %request.method, url = %request.url)
    )]
    fn send(&self, request: &Request) -> Result<RawResponse> {
        let mut builder = self.client.request(request.method.into(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().map_err(classify_transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .map_err(classify_transport_error)
            .context("Failed to read response body")?;

        Ok(RawResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// A request reqwest refused to build (bad URL, bad header) can never succeed;
/// everything else that reaches this point is a network-level failure.
fn classify_transport_error(error: reqwest::Error) -> anyhow::Error {
    if error.is_builder() {
        anyhow::Error::from(NonRetryableError::InvalidRequest(error.to_string()))
    } else {
        anyhow::Error::from(error).context("Failed to send request")
    }
}
