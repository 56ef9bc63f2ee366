//! Fixed-delay retry for network operations, with error classification.

use anyhow::{Result, anyhow};
use log::{debug, warn};
use reqwest::StatusCode;
use std::time::Duration;

/// Number of retries after the first attempt when the caller does not say otherwise.
pub const DEFAULT_RETRIES: usize = 5;

/// Delay between attempts when the caller does not say otherwise.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// How often, and how patiently, a request is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts made after the first one fails.
    pub retries: usize,
    /// Fixed pause before every retry.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: usize, retry_delay: Duration) -> Self {
        Self {
            retries,
            retry_delay,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Total number of attempts, including the first.
    pub fn attempts(&self) -> usize {
        self.retries.saturating_add(1)
    }
}

/// Errors that should not be retried, or that a request ended with once
/// retries ran out on a client error status.
#[derive(Debug)]
pub enum NonRetryableError {
    /// The response declared a Content-Encoding other than gzip
    UnsupportedEncoding(String),
    /// The request could not be built (malformed URL or header)
    InvalidRequest(String),
    /// Authentication required or rejected (HTTP 401)
    Unauthorized(String),
    /// Forbidden access (HTTP 403)
    Forbidden(String),
    /// Resource not found (HTTP 404)
    NotFound(String),
    /// Rate limited (HTTP 429)
    TooManyRequests(String),
    /// Other client errors that won't succeed on retry
    ClientError(String),
}

impl std::fmt::Display for NonRetryableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NonRetryableError::UnsupportedEncoding(encoding) => {
                write!(f, "Unsupported Content-Encoding: {}", encoding)
            }
            NonRetryableError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            NonRetryableError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            NonRetryableError::Forbidden(msg) => write!(f, "Access forbidden: {}", msg),
            NonRetryableError::NotFound(msg) => write!(f, "Not found: {}", msg),
            NonRetryableError::TooManyRequests(msg) => {
                write!(f, "Too many requests: {}. Try again later.", msg)
            }
            NonRetryableError::ClientError(msg) => write!(f, "Request error: {}", msg),
        }
    }
}

impl std::error::Error for NonRetryableError {}

/// An HTTP error status (4xx or 5xx). Retried like a network error.
#[derive(Debug)]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub url: String,
}

impl std::fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {} from {}", self.status, self.url)
    }
}

impl std::error::Error for HttpStatusError {}

/// Classifies a response status.
/// Returns Ok(()) if the status is not a client error, Err with a user-friendly message if it is.
pub fn classify_status(status: StatusCode, url: &str) -> Result<(), NonRetryableError> {
    match status {
        StatusCode::UNAUTHORIZED => Err(NonRetryableError::Unauthorized(url.to_string())),
        StatusCode::FORBIDDEN => Err(NonRetryableError::Forbidden(url.to_string())),
        StatusCode::NOT_FOUND => Err(NonRetryableError::NotFound(url.to_string())),
        StatusCode::TOO_MANY_REQUESTS => Err(NonRetryableError::TooManyRequests(url.to_string())),
        s if s.is_client_error() => Err(NonRetryableError::ClientError(format!(
            "HTTP {} from {}",
            s.as_u16(),
            url
        ))),
        _ => Ok(()),
    }
}

/// Turns any status >= 400 into a retryable [`HttpStatusError`].
pub fn check_status(status: StatusCode, url: &str) -> Result<()> {
    if status.is_client_error() || status.is_server_error() {
        return Err(anyhow::Error::from(HttpStatusError {
            status,
            url: url.to_string(),
        }));
    }
    Ok(())
}

/// Rewrites the error left over after retries ran out: a final 4xx becomes
/// the matching [`NonRetryableError`]. Anything else is returned unchanged.
pub fn classify_failure(error: anyhow::Error) -> anyhow::Error {
    let classified = error
        .downcast_ref::<HttpStatusError>()
        .and_then(|e| classify_status(e.status, &e.url).err());
    match classified {
        Some(non_retryable) => anyhow::Error::from(non_retryable),
        None => error,
    }
}

/// Everything that isn't explicitly non-retryable is treated as transient.
fn is_retryable_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<NonRetryableError>().is_none()
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.attempts()` attempts have been made. Sleeps `policy.retry_delay`
/// between attempts and returns the last error on exhaustion.
pub fn with_retry<F, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = policy.attempts();
    let mut last_error = None;

    for attempt in 1..=attempts {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable_error(&e) {
                    debug!("{}: non-retryable error: {}", operation_name, e);
                    return Err(e);
                }

                if attempt < attempts {
                    warn!(
                        "{}: attempt {}/{} failed ({:#}), retrying in {:?}...",
                        operation_name, attempt, attempts, e, policy.retry_delay
                    );
                    std::thread::sleep(policy.retry_delay);
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| anyhow!("{}: failed after {} attempts", operation_name, attempts)))
}
