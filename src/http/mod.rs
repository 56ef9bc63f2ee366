//! HTTP client module with retry logic, gzip decompression and charset decoding.
//!
//! The free functions build a fresh [`HttpClient`] per call, so nothing is
//! shared between requests.

mod client;
mod decode;
mod retry;
mod transport;

pub use client::{HttpClient, RequestOptions};
pub use decode::{decode_using_charset, decompress_using_encoding};
pub use retry::{
    DEFAULT_RETRIES, DEFAULT_RETRY_DELAY, HttpStatusError, NonRetryableError, RetryPolicy,
    check_status, classify_failure, classify_status, with_retry,
};
pub use transport::{Method, RawResponse, ReqwestTransport, Request, Transport};

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Performs a request with `method` and returns the decoded response text.
pub fn request(
    method: Method,
    url: &str,
    data: Option<Vec<u8>>,
    options: &RequestOptions,
) -> Result<String> {
    HttpClient::new()?.request(method, url, data, options)
}

pub fn get(url: &str, options: &RequestOptions) -> Result<String> {
    HttpClient::new()?.get(url, options)
}

pub fn post(url: &str, data: impl Into<Vec<u8>>, options: &RequestOptions) -> Result<String> {
    HttpClient::new()?.post(url, data, options)
}

pub fn delete(url: &str, options: &RequestOptions) -> Result<String> {
    HttpClient::new()?.delete(url, options)
}

/// JSON variant of [`request`]: serializes `data`, sends JSON headers and
/// parses the response.
pub fn request_json<B, R>(
    method: Method,
    url: &str,
    data: Option<&B>,
    options: &RequestOptions,
) -> Result<R>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    HttpClient::new()?.request_json(method, url, data, options)
}

pub fn get_json<R: DeserializeOwned>(url: &str, options: &RequestOptions) -> Result<R> {
    HttpClient::new()?.get_json(url, options)
}

pub fn post_json<B, R>(url: &str, data: &B, options: &RequestOptions) -> Result<R>
where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
{
    HttpClient::new()?.post_json(url, data, options)
}

pub fn delete_json<R: DeserializeOwned>(url: &str, options: &RequestOptions) -> Result<R> {
    HttpClient::new()?.delete_json(url, options)
}
