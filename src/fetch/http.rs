use async_trait::async_trait;
use futures::StreamExt;
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use std::time::Duration;

use super::{Fetch, FetchError, FetchRequest, FetchResponse};

/// Maximum body size accepted from any page or feed (10MB)
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const MAX_REDIRECTS: usize = 5;

const ACCEPT: &str =
    "text/html,application/xhtml+xml,application/rss+xml,application/atom+xml,application/xml;q=0.9,*/*;q=0.8";

/// [`Fetch`] implementation backed by a pooled `reqwest::Client`.
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_body: usize,
}

impl HttpFetcher {
    /// Builds a client with the configured User-Agent and per-request timeout.
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(redirect_policy())
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self::with_client(client, timeout))
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            max_body: MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }
}

fn redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("Too many redirects");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev.as_str() == url.as_str()) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );
        attempt.follow()
    })
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let mut headers = request.headers.clone();
        headers
            .entry(reqwest::header::ACCEPT)
            .or_insert(reqwest::header::HeaderValue::from_static(ACCEPT));

        let send = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(headers)
            .send();

        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let headers = response.headers().clone();
        tracing::debug!(url = %request.url, status = status.as_u16(), "Fetched");

        let body = if request.method == Method::HEAD || status == StatusCode::NOT_MODIFIED {
            Vec::new()
        } else {
            read_limited_bytes(response, self.max_body).await?
        };

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

/// Reads a response body, refusing to buffer more than `limit` bytes.
///
/// Rejects early on an oversized Content-Length, then enforces the cap while
/// streaming for servers that lie or omit the header. A body shorter than the
/// announced Content-Length is reported as [`FetchError::IncompleteResponse`].
async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_reqwest_error)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new("blogwatch-test/0.1", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<rss/>")
                    .insert_header("Content-Type", "application/rss+xml")
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/feed.xml", server.uri())).unwrap();
        let resp = fetcher().fetch(&FetchRequest::get(url)).await.unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"<rss/>");
        assert_eq!(resp.etag().as_deref(), Some("\"v1\""));
        assert!(resp.content_type().contains("rss"));
    }

    #[tokio::test]
    async fn test_fetch_sends_conditional_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/feed.xml", server.uri())).unwrap();
        let req = FetchRequest::get(url).conditional(Some("\"v1\""), None);
        let resp = fetcher().fetch(&req).await.unwrap();

        assert!(resp.is_not_modified());
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let resp = fetcher().fetch(&FetchRequest::get(url)).await.unwrap();
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(2048)))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).unwrap();
        let result = fetcher()
            .with_max_body(1024)
            .fetch(&FetchRequest::get(url))
            .await;
        assert!(matches!(result, Err(FetchError::ResponseTooLarge)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Port 9 (discard) is almost never listening locally
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let result = fetcher().fetch(&FetchRequest::get(url)).await;
        assert!(matches!(
            result,
            Err(FetchError::Network(_)) | Err(FetchError::Timeout)
        ));
    }
}
