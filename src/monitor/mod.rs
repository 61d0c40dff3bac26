//! Per-blog monitoring and the run that drives it.
//!
//! # Architecture
//!
//! - [`change`] - pure comparison of an extraction against the stored last post
//! - [`hybrid`] - the feed-then-scrape state machine for one blog
//! - [`run`] - bounded worker pool over all blogs, deadline and summary
//!
//! Everything a worker needs (fetcher, limiter, settings, overrides,
//! deadline) travels in a [`MonitorContext`]; there is no global state.

pub mod change;
pub mod hybrid;
mod retry;
pub mod run;

pub use change::{detect_changes, ChangeReport, ChangeStatus};
pub use hybrid::{check_blog, BlogReport, Issue, Outcome, Source, Stage};
pub use run::{
    initialize, run_all, Attention, Baseline, LogSink, NotificationSink, RunError, RunSummary,
};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::OverrideStore;
use crate::fetch::{Fetch, FetchError, HostLimiter};
use crate::model::ErrorKind;

/// Why one attempt at a blog failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MonitorError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    /// HTTP 429, with the server's Retry-After when it sent one
    #[error("Rate limited")]
    RateLimited(Option<Duration>),
    #[error("Response too large")]
    ResponseTooLarge,
    #[error("Malformed content: {0}")]
    MalformedContent(String),
    #[error("Selector break: {0}")]
    SelectorBreak(String),
    #[error("Feed unavailable: {0}")]
    FeedUnavailable(String),
    #[error("Run deadline reached")]
    Deadline,
}

impl MonitorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MonitorError::Network(_) | MonitorError::HttpStatus(_) | MonitorError::RateLimited(_) => {
                ErrorKind::Network
            }
            MonitorError::ResponseTooLarge | MonitorError::MalformedContent(_) => {
                ErrorKind::MalformedContent
            }
            MonitorError::SelectorBreak(_) => ErrorKind::SelectorBreak,
            MonitorError::FeedUnavailable(_) => ErrorKind::FeedUnavailable,
            MonitorError::Deadline => ErrorKind::Deadline,
        }
    }

    /// Network errors, 429, 5xx and malformed content may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            MonitorError::Network(_)
            | MonitorError::RateLimited(_)
            | MonitorError::MalformedContent(_) => true,
            MonitorError::HttpStatus(status) => *status >= 500,
            MonitorError::ResponseTooLarge
            | MonitorError::SelectorBreak(_)
            | MonitorError::FeedUnavailable(_)
            | MonitorError::Deadline => false,
        }
    }
}

impl From<FetchError> for MonitorError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::ResponseTooLarge => MonitorError::ResponseTooLarge,
            other => MonitorError::Network(other.to_string()),
        }
    }
}

/// Tunables for checking blogs.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Attempts per fetch, including the first
    pub retry_count: u32,
    pub failure_threshold: u32,
    pub concurrency: usize,
    /// Minimum spacing between requests to one host
    pub request_delay: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Detected selectors below this are never used
    pub min_confidence: f64,
    pub reminder_interval_days: i64,
    /// `None` runs without a deadline
    pub run_deadline: Option<Duration>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            retry_count: 3,
            failure_threshold: 3,
            concurrency: 4,
            request_delay: Duration::from_millis(1000),
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            min_confidence: 0.5,
            reminder_interval_days: 14,
            run_deadline: Some(Duration::from_secs(600)),
        }
    }
}

/// Shared resources handed to every worker.
#[derive(Clone)]
pub struct MonitorContext {
    pub fetcher: Arc<dyn Fetch>,
    pub limiter: Arc<HostLimiter>,
    pub settings: MonitorSettings,
    pub overrides: Arc<OverrideStore>,
    pub deadline: Option<Instant>,
}

impl MonitorContext {
    /// Builds a context whose deadline starts counting now.
    pub fn new(fetcher: Arc<dyn Fetch>, settings: MonitorSettings) -> Self {
        Self {
            fetcher,
            limiter: Arc::new(HostLimiter::new(settings.request_delay)),
            deadline: settings.run_deadline.map(|d| Instant::now() + d),
            settings,
            overrides: Arc::new(OverrideStore::default()),
        }
    }

    pub fn with_overrides(mut self, overrides: OverrideStore) -> Self {
        self.overrides = Arc::new(overrides);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub(crate) fn check_deadline(&self) -> Result<(), MonitorError> {
        if self.deadline_passed() {
            Err(MonitorError::Deadline)
        } else {
            Ok(())
        }
    }
}
