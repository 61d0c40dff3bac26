//! One-off diagnosis of a feed URL.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tokio::time::Instant;
use url::Url;

use super::discovery::FEED_MIME_TYPES;
use super::parser::{parse_feed, FeedDialect, ParsedFeed};
use crate::fetch::{Fetch, FetchRequest, FetchResponse};

/// A newest entry older than this draws a warning.
pub const STALE_AFTER_DAYS: i64 = 90;

/// Reachability, validity and quality of one feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedHealth {
    pub url: String,
    /// Answered with a 2xx status
    pub reachable: bool,
    /// Parsed as a feed
    pub valid: bool,
    pub status: Option<u16>,
    pub response_ms: Option<u64>,
    pub dialect: Option<FeedDialect>,
    pub entry_count: usize,
    pub latest_entry: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl FeedHealth {
    fn new(url: &Url) -> Self {
        Self {
            url: url.to_string(),
            reachable: false,
            valid: false,
            status: None,
            response_ms: None,
            dialect: None,
            entry_count: 0,
            latest_entry: None,
            etag: None,
            last_modified: None,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Valid and free of errors.
    pub fn is_healthy(&self) -> bool {
        self.valid && self.errors.is_empty()
    }
}

/// Fetches `url` once and reports on it. Never fails; fetch errors land in
/// [`FeedHealth::errors`].
pub async fn check_feed_health(fetcher: &dyn Fetch, url: &Url) -> FeedHealth {
    let started = Instant::now();
    match fetcher.fetch(&FetchRequest::get(url.clone())).await {
        Ok(resp) => {
            let mut health = assess(url, &resp, Utc::now());
            health.response_ms = Some(started.elapsed().as_millis() as u64);
            health
        }
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Feed health fetch failed");
            let mut health = FeedHealth::new(url);
            health.errors.push(e.to_string());
            health
        }
    }
}

/// Grades a fetched response. `now` anchors the staleness check.
pub fn assess(url: &Url, resp: &FetchResponse, now: DateTime<Utc>) -> FeedHealth {
    let mut health = FeedHealth::new(url);
    health.status = Some(resp.status.as_u16());
    health.reachable = resp.status.is_success();
    if !health.reachable {
        health
            .errors
            .push(format!("HTTP status {}", resp.status.as_u16()));
        return health;
    }

    health.etag = resp.etag();
    health.last_modified = resp.last_modified();
    if health.etag.is_none() && health.last_modified.is_none() {
        health
            .warnings
            .push("No ETag or Last-Modified header; every check downloads the whole feed".to_string());
    }

    let content_type = resp.content_type();
    let feed_type = FEED_MIME_TYPES.iter().any(|t| content_type.contains(t))
        || content_type.contains("json");
    if !feed_type {
        let shown = if content_type.is_empty() { "none" } else { content_type.as_str() };
        health
            .warnings
            .push(format!("Unexpected content type: {shown}"));
    }

    match parse_feed(&resp.body, url, "") {
        Ok(parsed) => {
            health.valid = true;
            health.dialect = Some(parsed.dialect);
            health.entry_count = parsed.posts.len() + parsed.skipped;
            check_quality(&parsed, now, &mut health);
        }
        Err(e) => health.errors.push(e.to_string()),
    }
    health
}

fn check_quality(parsed: &ParsedFeed, now: DateTime<Utc>, health: &mut FeedHealth) {
    let posts = &parsed.posts;
    if posts.is_empty() {
        health.warnings.push("Feed has no entries".to_string());
        return;
    }
    if parsed.skipped > 0 {
        health
            .warnings
            .push(format!("{} entries have no usable link", parsed.skipped));
    }

    health.latest_entry = posts.iter().filter_map(|p| p.published_at).max();
    if let Some(latest) = health.latest_entry {
        let age = (now - latest).num_days();
        if age > STALE_AFTER_DAYS {
            health
                .warnings
                .push(format!("Latest entry is {age} days old"));
        }
    }

    let undated = posts.iter().filter(|p| p.published_at.is_none()).count();
    if undated > 0 {
        health
            .warnings
            .push(format!("{undated} entries lack publication dates"));
    }

    let bare = posts.iter().filter(|p| p.excerpt.is_none()).count();
    if bare * 2 > posts.len() {
        health
            .warnings
            .push("Most entries lack a description".to_string());
    }

    let unique: HashSet<&str> = posts.iter().map(|p| p.url.as_str()).collect();
    if unique.len() != posts.len() {
        health
            .warnings
            .push("Feed contains duplicate entries".to_string());
    }
}
