//! Canned-response [`Fetch`] double for unit tests.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{Fetch, FetchError, FetchRequest, FetchResponse};

#[derive(Clone)]
pub enum Reply {
    Response(FetchResponse),
    NetworkError,
}

/// Serves replies keyed by exact URL. A route with several replies serves
/// them in order and then keeps repeating the last one. Unknown URLs get 404.
#[derive(Default)]
pub struct StubFetcher {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<FetchRequest>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, reply: Reply) -> Self {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn html(self, url: &str, body: &str) -> Self {
        self.route(
            url,
            Reply::Response(
                FetchResponse::new(StatusCode::OK, body).with_header(CONTENT_TYPE, "text/html"),
            ),
        )
    }

    pub fn xml(self, url: &str, body: &str) -> Self {
        self.route(
            url,
            Reply::Response(
                FetchResponse::new(StatusCode::OK, body)
                    .with_header(CONTENT_TYPE, "application/rss+xml"),
            ),
        )
    }

    pub fn status(self, url: &str, status: u16) -> Self {
        let status = StatusCode::from_u16(status).unwrap();
        self.route(url, Reply::Response(FetchResponse::new(status, Vec::new())))
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.as_str() == url)
            .count()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetch for StubFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.calls.lock().unwrap().push(request.clone());
        let reply = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(request.url.as_str()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        match reply {
            Some(Reply::Response(resp)) => Ok(resp),
            Some(Reply::NetworkError) => Err(FetchError::Network("connection reset".into())),
            None => Ok(FetchResponse::new(StatusCode::NOT_FOUND, Vec::new())),
        }
    }
}
