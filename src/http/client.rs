//! Blocking HTTP client with built-in retry, decompression and charset decoding.

use anyhow::{Context, Result};
use log::debug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::decode::{decode_using_charset, decompress_using_encoding};
use super::retry::{RetryPolicy, check_status, classify_failure, with_retry};
use super::transport::{
    Method, RawResponse, ReqwestTransport, Request, Transport, set_header,
};

const JSON_MEDIA_TYPE: &str = "application/json";

/// Per-call options: extra headers, retry tuning and a transport timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub headers: Vec<(String, String)>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header, replacing any previous value for the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, name.into(), value.into());
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retry.retries = retries;
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry.retry_delay = retry_delay;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn with_json_headers(&self) -> Self {
        self.clone()
            .header("Content-Type", JSON_MEDIA_TYPE)
            .header("Accept", JSON_MEDIA_TYPE)
    }

    fn build_request(&self, method: Method, url: &str, data: Option<Vec<u8>>) -> Request {
        Request {
            method,
            url: url.to_string(),
            headers: self.headers.clone(),
            body: data,
            timeout: self.timeout,
        }
    }
}

/// HTTP client that retries transient failures and returns decoded text.
#[derive(Clone)]
pub struct HttpClient<T = ReqwestTransport> {
    transport: T,
}

impl HttpClient<ReqwestTransport> {
    /// Creates a client on a fresh non-pooling reqwest transport.
    pub fn new() -> Result<Self> {
        Ok(Self::with_transport(ReqwestTransport::new()?))
    }
}

impl<T: Transport> HttpClient<T> {
    pub fn with_transport(transport: T) -> Self {
        Self { transport }
    }

    /// Performs a request and returns the decoded response text.
    #[tracing::instrument(skip(self, data, options))]
    pub fn request(
        &self,
        method: Method,
        url: &str,
        data: Option<Vec<u8>>,
        options: &RequestOptions,
    ) -> Result<String> {
        let request = options.build_request(method, url, data);
        self.send(&request, &options.retry)
    }

    /// Sends an already-built request.
    ///
    /// Network failures and error statuses (>= 400) are retried according to
    /// `policy`; a 4xx that outlives the retries is reported as the matching
    /// [`NonRetryableError`](super::retry::NonRetryableError). The body is then
    /// gunzipped if needed and decoded with the declared charset. Decoding
    /// problems are never retried.
    pub fn send(&self, request: &Request, policy: &RetryPolicy) -> Result<String> {
        debug!("{} {}...", request.method, request.url);

        let operation = format!("{} {}", request.method, request.url);
        let response =
            with_retry(&operation, policy, || self.send_once(request)).map_err(classify_failure)?;

        debug!(
            "{} {} -> {} ({} bytes)",
            request.method,
            request.url,
            response.status,
            response.body.len()
        );

        let body = decompress_using_encoding(&response.headers, response.body)?;
        Ok(decode_using_charset(&response.headers, &body))
    }

    /// Single attempt without retry.
    fn send_once(&self, request: &Request) -> Result<RawResponse> {
        let response = self.transport.send(request)?;
        check_status(response.status, &request.url)?;
        Ok(response)
    }

    pub fn get(&self, url: &str, options: &RequestOptions) -> Result<String> {
        self.request(Method::Get, url, None, options)
    }

    pub fn post(
        &self,
        url: &str,
        data: impl Into<Vec<u8>>,
        options: &RequestOptions,
    ) -> Result<String> {
        self.request(Method::Post, url, Some(data.into()), options)
    }

    pub fn delete(&self, url: &str, options: &RequestOptions) -> Result<String> {
        self.request(Method::Delete, url, None, options)
    }

    /// Serializes `data` as JSON, sends it with JSON headers and parses the
    /// response as JSON.
    #[tracing::instrument(skip(self, data, options))]
    pub fn request_json<B, R>(
        &self,
        method: Method,
        url: &str,
        data: Option<&B>,
        options: &RequestOptions,
    ) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let body = data
            .map(serde_json::to_vec)
            .transpose()
            .context("Failed to serialize JSON request body")?;
        self.request_json_text(method, url, body, options)
    }

    /// Like [`request_json`](Self::request_json), but `data` is already
    /// JSON text and is sent unchanged.
    pub fn request_json_text<R: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        data: Option<Vec<u8>>,
        options: &RequestOptions,
    ) -> Result<R> {
        let text = self.request(method, url, data, &options.with_json_headers())?;
        serde_json::from_str(&text).context("Failed to parse JSON response")
    }

    pub fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<R> {
        self.request_json_text(Method::Get, url, None, options)
    }

    pub fn post_json<B, R>(&self, url: &str, data: &B, options: &RequestOptions) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request_json(Method::Post, url, Some(data), options)
    }

    /// Posts pre-serialized JSON text.
    pub fn post_json_text<R: DeserializeOwned>(
        &self,
        url: &str,
        data: impl Into<Vec<u8>>,
        options: &RequestOptions,
    ) -> Result<R> {
        self.request_json_text(Method::Post, url, Some(data.into()), options)
    }

    pub fn delete_json<R: DeserializeOwned>(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<R> {
        self.request_json_text(Method::Delete, url, None, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::retry::{HttpStatusError, NonRetryableError};
    use crate::http::transport::MockTransport;
    use anyhow::anyhow;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use mockall::Sequence;
    use reqwest::StatusCode;
    use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderValue};
    use serde_json::{Value, json};
    use std::io::Write;
    use std::time::Instant;

    fn fast(retries: usize) -> RequestOptions {
        RequestOptions::new()
            .retries(retries)
            .retry_delay(Duration::from_millis(10))
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_request_options_builder() {
        let options = RequestOptions::new()
            .header("X-A", "1")
            .header("x-a", "2")
            .retries(1)
            .retry_delay(Duration::from_secs(2))
            .timeout(Duration::from_secs(3));

        assert_eq!(options.headers, vec![("x-a".to_string(), "2".to_string())]);
        assert_eq!(options.retry, RetryPolicy::new(1, Duration::from_secs(2)));
        assert_eq!(options.timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_json_headers_override_caller_values() {
        let options = RequestOptions::new()
            .header("content-type", "text/plain")
            .header("X-Keep", "yes")
            .with_json_headers();

        let request = options.build_request(Method::Post, "http://x/", None);
        assert_eq!(request.header_value("Content-Type"), Some(JSON_MEDIA_TYPE));
        assert_eq!(request.header_value("Accept"), Some(JSON_MEDIA_TYPE));
        assert_eq!(request.header_value("x-keep"), Some("yes"));
        assert_eq!(request.headers.len(), 3);
    }

    #[test]
    fn test_request_passes_descriptor_to_transport() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|request| {
                request.method == Method::Post
                    && request.url == "http://example.test/items"
                    && request.body.as_deref() == Some(b"payload".as_slice())
                    && request.header_value("X-Id") == Some("7")
                    && request.timeout == Some(Duration::from_secs(9))
            })
            .times(1)
            .returning(|_| Ok(RawResponse::new(StatusCode::OK, "stored")));

        let client = HttpClient::with_transport(transport);
        let options = fast(0).header("X-Id", "7").timeout(Duration::from_secs(9));
        let text = client
            .post("http://example.test/items", "payload", &options)
            .unwrap();

        assert_eq!(text, "stored");
    }

    #[test]
    fn test_gzip_body_is_decompressed_and_decoded() {
        let body = gzip("grüße".as_bytes());
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(move |_| {
            Ok(RawResponse::new(StatusCode::OK, body.clone())
                .with_header(CONTENT_ENCODING, HeaderValue::from_static("gzip"))
                .with_header(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                ))
        });

        let client = HttpClient::with_transport(transport);
        assert_eq!(client.get("http://x/", &fast(3)).unwrap(), "grüße");
    }

    #[test]
    fn test_unsupported_encoding_is_not_retried() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Ok(RawResponse::new(StatusCode::OK, "xx")
                .with_header(CONTENT_ENCODING, HeaderValue::from_static("deflate")))
        });

        let client = HttpClient::with_transport(transport);
        let err = client.get("http://x/", &fast(5)).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<NonRetryableError>(),
            Some(NonRetryableError::UnsupportedEncoding(e)) if e == "deflate"
        ));
    }

    #[test]
    fn test_missing_charset_decodes_as_ascii() {
        let mut transport = MockTransport::new();
        transport.expect_send().returning(|_| {
            Ok(RawResponse::new(StatusCode::OK, b"r\xc3\xa9sum\xc3\xa9".to_vec())
                .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain")))
        });

        let client = HttpClient::with_transport(transport);
        assert_eq!(client.get("http://x/", &fast(0)).unwrap(), "rsum");
    }

    #[test_log::test]
    fn test_recovers_after_two_transport_failures() {
        let mut seq = Sequence::new();
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow!("connection refused")));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(RawResponse::new(StatusCode::OK, "finally")));

        let client = HttpClient::with_transport(transport);
        let start = Instant::now();
        let text = client.get("http://x/", &fast(5)).unwrap();

        assert_eq!(text, "finally");
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_always_failing_transport_makes_retries_plus_one_attempts() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_| Err(anyhow!("connection timed out")));

        let client = HttpClient::with_transport(transport);
        let err = client.get("http://x/", &fast(2)).unwrap_err();

        assert_eq!(err.to_string(), "connection timed out");
    }

    #[test]
    fn test_server_error_is_retried_then_surfaced() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(2)
            .returning(|_| Ok(RawResponse::new(StatusCode::BAD_GATEWAY, "down")));

        let client = HttpClient::with_transport(transport);
        let err = client.delete("http://x/thing", &fast(1)).unwrap_err();

        let status = err.downcast_ref::<HttpStatusError>().unwrap();
        assert_eq!(status.status, StatusCode::BAD_GATEWAY);
        assert_eq!(status.url, "http://x/thing");
    }

    #[test]
    fn test_client_error_is_retried_then_classified() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_| Ok(RawResponse::new(StatusCode::NOT_FOUND, "")));

        let client = HttpClient::with_transport(transport);
        let err = client.get("http://x/missing", &fast(2)).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<NonRetryableError>(),
            Some(NonRetryableError::NotFound(_))
        ));
    }

    #[test]
    fn test_client_error_recovers_when_status_clears() {
        let mut seq = Sequence::new();
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(RawResponse::new(StatusCode::TOO_MANY_REQUESTS, "slow down")));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(RawResponse::new(StatusCode::OK, "ready")));

        let client = HttpClient::with_transport(transport);
        assert_eq!(client.get("http://x/", &fast(1)).unwrap(), "ready");
    }

    #[test]
    fn test_post_json_serializes_and_parses() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|request| {
                request.header_value("content-type") == Some(JSON_MEDIA_TYPE)
                    && request.header_value("accept") == Some(JSON_MEDIA_TYPE)
                    && serde_json::from_slice::<Value>(request.body.as_deref().unwrap_or_default())
                        .ok()
                        == Some(json!({"a": 1}))
            })
            .times(1)
            .returning(|_| {
                Ok(RawResponse::new(StatusCode::OK, r#"{"ok": true, "id": 12}"#).with_header(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json; charset=utf-8"),
                ))
            });

        let client = HttpClient::with_transport(transport);
        let value: Value = client
            .post_json("http://x/", &json!({"a": 1}), &fast(0))
            .unwrap();

        assert_eq!(value, json!({"ok": true, "id": 12}));
    }

    #[test]
    fn test_post_json_text_is_sent_unchanged() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|request| request.body.as_deref() == Some(br#"{"raw":true}"#.as_slice()))
            .times(1)
            .returning(|_| Ok(RawResponse::new(StatusCode::OK, "[]")));

        let client = HttpClient::with_transport(transport);
        let value: Vec<u32> = client
            .post_json_text("http://x/", r#"{"raw":true}"#, &fast(0))
            .unwrap();

        assert!(value.is_empty());
    }

    #[test]
    fn test_invalid_json_response_fails_once() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(RawResponse::new(StatusCode::OK, "<html>oops</html>")));

        let client = HttpClient::with_transport(transport);
        let err = client
            .get_json::<Value>("http://x/", &fast(3))
            .unwrap_err();

        assert_eq!(err.to_string(), "Failed to parse JSON response");
        assert!(err.downcast_ref::<serde_json::Error>().is_some());
    }

    #[test]
    fn test_get_json_against_server() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/status")
            .match_header("accept", JSON_MEDIA_TYPE)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("content-encoding", "gzip")
            .with_body(gzip(br#"{"name": "test", "value": 42}"#))
            .create();

        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Status {
            name: String,
            value: i32,
        }

        let client = HttpClient::new().unwrap();
        let status: Status = client
            .get_json(&format!("{}/status", server.url()), &fast(0))
            .unwrap();

        mock.assert();
        assert_eq!(
            status,
            Status {
                name: "test".to_string(),
                value: 42
            }
        );
    }

    #[test]
    fn test_delete_json_against_server() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("DELETE", "/items/3")
            .match_header("content-type", JSON_MEDIA_TYPE)
            .with_status(200)
            .with_body(r#"{"deleted": 3}"#)
            .create();

        let client = HttpClient::new().unwrap();
        let value: Value = client
            .delete_json(&format!("{}/items/3", server.url()), &fast(0))
            .unwrap();

        mock.assert();
        assert_eq!(value["deleted"], 3);
    }

    #[test]
    fn test_server_unavailable_against_server() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(3)
            .create();

        let client = HttpClient::new().unwrap();
        let result = client.get(&format!("{}/flaky", server.url()), &fast(2));

        mock.assert();
        assert!(result.is_err());
    }

    #[test]
    fn test_with_client_keeps_configured_defaults() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/configured")
            .match_header("x-deployment", "staging")
            .with_status(200)
            .with_body("configured")
            .create();

        let mut defaults = reqwest::header::HeaderMap::new();
        defaults.insert("x-deployment", HeaderValue::from_static("staging"));
        let inner = reqwest::blocking::Client::builder()
            .default_headers(defaults)
            .build()
            .unwrap();

        let client = HttpClient::with_transport(ReqwestTransport::with_client(inner));
        let text = client
            .get(&format!("{}/configured", server.url()), &fast(0))
            .unwrap();

        mock.assert();
        assert_eq!(text, "configured");
    }
}
