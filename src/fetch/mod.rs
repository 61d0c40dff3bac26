//! The fetch capability the monitor depends on.
//!
//! Everything that touches the network goes through the [`Fetch`] trait so
//! the pipeline can run against canned responses in tests:
//!
//! - [`HttpFetcher`] - the real implementation on top of `reqwest`
//! - [`HostLimiter`] - per-host politeness delay shared by all workers

mod http;
mod limiter;
#[cfg(test)]
pub(crate) mod stub;

pub use http::HttpFetcher;
pub use limiter::HostLimiter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use url::Url;

/// Errors produced by a [`Fetch`] implementation.
///
/// HTTP error statuses are *not* errors at this level; callers inspect
/// [`FetchResponse::status`] and decide what is retryable.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Response too large")]
    ResponseTooLarge,
    /// Fewer bytes arrived than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// A single outgoing request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
        }
    }

    /// Adds a header. Values that are not valid header text are dropped with
    /// a debug log rather than failing the request.
    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(v) => {
                self.headers.insert(name, v);
            }
            Err(e) => {
                tracing::debug!(header = %name, error = %e, "Dropping invalid header value");
            }
        }
        self
    }

    /// Adds `If-None-Match` / `If-Modified-Since` from cached validators.
    pub fn conditional(
        self,
        etag: Option<&str>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        let with_etag = match etag {
            Some(tag) => self.header(reqwest::header::IF_NONE_MATCH, tag),
            None => self,
        };
        match last_modified {
            Some(when) => with_etag.header(
                reqwest::header::IF_MODIFIED_SINCE,
                &format_http_date(when),
            ),
            None => with_etag,
        }
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Builder used mostly by test doubles.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(v) = HeaderValue::from_str(value) {
            self.headers.insert(name, v);
        }
        self
    }

    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Lower-cased Content-Type, empty when absent.
    pub fn content_type(&self) -> String {
        self.header_str(&CONTENT_TYPE)
            .unwrap_or("")
            .to_ascii_lowercase()
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED
    }

    pub fn etag(&self) -> Option<String> {
        self.header_str(&ETAG).map(str::to_owned)
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.header_str(&LAST_MODIFIED).and_then(parse_http_date)
    }
}

/// Something that can perform HTTP requests.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// Formats a timestamp as an IMF-fixdate (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn format_http_date(when: DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses an HTTP date header; RFC 2822 covers the IMF-fixdate form.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
