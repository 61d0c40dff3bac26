//! The per-blog state machine.
//!
//! ```text
//! Init -> TryFeed -> FeedOk ------------------------------> Done
//!                 \-> FeedFailed -> TryScrape -> ScrapeOk --> Done
//!                                            \-> ScrapeFailed -> Done
//! ```
//!
//! `Scrape` blogs enter at `TryScrape`; `FeedReminder` blogs go straight to
//! `Done` and only evaluate whether a reminder is due.

use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use scraper::Html;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use super::change::{detect_changes, ChangeStatus};
use super::retry::with_retry;
use super::{MonitorContext, MonitorError};
use crate::feed::{discover_feeds, parse_feed, FeedParseError};
use crate::fetch::{FetchRequest, FetchResponse};
use crate::model::{Blog, BlogState, ErrorKind, MonitoringStrategy, Post};
use crate::scrape::{detect, extract_posts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    TryFeed,
    FeedOk,
    FeedFailed,
    TryScrape,
    ScrapeOk,
    ScrapeFailed,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    /// Succeeded, but the result or the blog's history is suspect
    Degraded,
    /// Every attempted path failed
    Failed,
}

/// Which path produced the posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Feed,
    /// Conditional GET answered 304
    FeedNotModified,
    Scrape,
}

/// A problem met while checking a blog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
}

/// Everything one check produced. `state` is the proposed post-run state.
#[derive(Debug, Clone)]
pub struct BlogReport {
    pub blog_name: String,
    /// Newest first
    pub new_posts: Vec<Post>,
    pub state: BlogState,
    pub outcome: Outcome,
    pub issues: Vec<Issue>,
    pub source: Option<Source>,
    pub change: Option<ChangeStatus>,
    pub reminder_due: bool,
    pub stages: Vec<Stage>,
    /// False when the state must not be persisted (run cut short)
    pub persist: bool,
}

impl BlogReport {
    /// Failed before any stage ran; the prior state is kept as-is.
    pub fn not_started(blog_name: &str, state: BlogState, error: &MonitorError) -> Self {
        Self {
            blog_name: blog_name.to_string(),
            new_posts: Vec::new(),
            state,
            outcome: Outcome::Failed,
            issues: vec![Issue {
                kind: error.kind(),
                stage: Stage::Init,
                message: error.to_string(),
            }],
            source: None,
            change: None,
            reminder_due: false,
            stages: Vec::new(),
            persist: false,
        }
    }

    /// Selector break this run, or a failure streak at the threshold.
    pub fn needs_attention(&self, failure_threshold: u32) -> bool {
        self.issues.iter().any(|i| i.kind == ErrorKind::SelectorBreak)
            || self.state.consecutive_failures >= failure_threshold
    }

    /// The issue that best explains the outcome.
    pub fn primary_issue(&self) -> Option<&Issue> {
        self.issues
            .iter()
            .find(|i| i.kind == ErrorKind::SelectorBreak)
            .or_else(|| self.issues.last())
    }
}

enum Extraction {
    Posts(Vec<Post>, Source),
    NotModified,
}

/// Checks one blog, returning its report and proposed new state.
///
/// Never fails: every problem is recorded as an [`Issue`] on the report.
pub async fn check_blog(ctx: &MonitorContext, blog: &Blog, prior: BlogState) -> BlogReport {
    let mut check = Check {
        ctx,
        blog,
        state: prior.clone(),
        prior,
        now: Utc::now(),
        stages: Vec::new(),
        issues: Vec::new(),
        extraction: None,
        reminder_due: false,
    };
    check.drive().await;
    check.finish()
}

struct Check<'a> {
    ctx: &'a MonitorContext,
    blog: &'a Blog,
    prior: BlogState,
    state: BlogState,
    now: DateTime<Utc>,
    stages: Vec<Stage>,
    issues: Vec<Issue>,
    extraction: Option<Extraction>,
    reminder_due: bool,
}

impl Check<'_> {
    async fn drive(&mut self) {
        let mut stage = Stage::Init;
        loop {
            self.stages.push(stage);
            stage = match stage {
                Stage::Init => match self.blog.strategy {
                    MonitoringStrategy::FeedReminder => {
                        self.evaluate_reminder();
                        Stage::Done
                    }
                    MonitoringStrategy::Scrape => Stage::TryScrape,
                    MonitoringStrategy::Hybrid => Stage::TryFeed,
                },
                Stage::TryFeed => match self.try_feed().await {
                    Ok(extraction) => {
                        self.extraction = Some(extraction);
                        Stage::FeedOk
                    }
                    Err(e) => {
                        self.record(Stage::TryFeed, &e);
                        Stage::FeedFailed
                    }
                },
                Stage::FeedFailed if self.cut_short() => Stage::Done,
                Stage::FeedFailed => Stage::TryScrape,
                Stage::TryScrape => match self.try_scrape().await {
                    Ok(posts) => {
                        self.extraction = Some(Extraction::Posts(posts, Source::Scrape));
                        Stage::ScrapeOk
                    }
                    Err(e) => {
                        self.record(Stage::TryScrape, &e);
                        Stage::ScrapeFailed
                    }
                },
                Stage::FeedOk | Stage::ScrapeOk | Stage::ScrapeFailed => Stage::Done,
                Stage::Done => break,
            };
        }
    }

    fn record(&mut self, stage: Stage, error: &MonitorError) {
        tracing::warn!(blog = %self.blog.name, stage = ?stage, error = %error, "Check stage failed");
        self.issues.push(Issue {
            kind: error.kind(),
            stage,
            message: error.to_string(),
        });
    }

    fn cut_short(&self) -> bool {
        self.issues.last().is_some_and(|i| i.kind == ErrorKind::Deadline)
    }

    fn evaluate_reminder(&mut self) {
        let interval = chrono::Duration::days(self.ctx.settings.reminder_interval_days);
        self.reminder_due = match self.state.last_checked_at {
            None => true,
            Some(at) => self.now - at >= interval,
        };
        if self.reminder_due {
            self.state.last_checked_at = Some(self.now);
        }
    }

    fn site_url(&self) -> Result<Url, MonitorError> {
        Url::parse(&self.blog.url)
            .map_err(|e| MonitorError::FeedUnavailable(format!("invalid blog URL: {e}")))
    }

    async fn try_feed(&mut self) -> Result<Extraction, MonitorError> {
        let cached = self
            .state
            .feed_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok());

        let feed_url = match &cached {
            Some(url) => url.clone(),
            None => self.discover().await?,
        };

        let request = FetchRequest::get(feed_url.clone()).conditional(
            self.state.feed_etag.as_deref(),
            self.state.feed_last_modified,
        );
        let (ctx, blog) = (self.ctx, self.blog);
        let name = blog.name.as_str();
        let fetched = with_retry(ctx, name, || async {
            let response = fetch_checked(ctx, &request).await?;
            if response.is_not_modified() {
                return Ok((response, None));
            }
            match parse_feed(&response.body, &feed_url, name) {
                Ok(parsed) => Ok((response, Some(parsed))),
                Err(FeedParseError::NotAFeed) => Err(MonitorError::FeedUnavailable(format!(
                    "{feed_url} no longer serves a feed"
                ))),
                Err(e) => Err(MonitorError::MalformedContent(e.to_string())),
            }
        })
        .await;

        let (response, parsed) = match fetched {
            Ok(ok) => ok,
            Err(e) => {
                let gone = matches!(e, MonitorError::HttpStatus(404 | 410))
                    || matches!(e, MonitorError::FeedUnavailable(_));
                if gone {
                    tracing::info!(blog = %self.blog.name, feed = %feed_url, "Dropping cached feed URL");
                    self.forget_feed();
                }
                return Err(e);
            }
        };

        let Some(parsed) = parsed else {
            tracing::debug!(blog = %self.blog.name, feed = %feed_url, "Feed not modified");
            return Ok(Extraction::NotModified);
        };

        self.state.feed_etag = response.etag();
        self.state.feed_last_modified = response.last_modified();
        if parsed.skipped > 0 {
            tracing::warn!(blog = %self.blog.name, feed = %feed_url, skipped = parsed.skipped, "Feed entries without usable links skipped");
        }
        Ok(Extraction::Posts(parsed.posts, Source::Feed))
    }

    /// One discovery call; the best candidate becomes the cached feed URL.
    async fn discover(&mut self) -> Result<Url, MonitorError> {
        self.ctx.check_deadline()?;
        let site = self.site_url()?;
        let candidates =
            discover_feeds(self.ctx.fetcher.as_ref(), &self.ctx.limiter, &site).await;
        let best = candidates
            .into_iter()
            .next()
            .ok_or_else(|| MonitorError::FeedUnavailable("no feed found".to_string()))?;

        tracing::info!(blog = %self.blog.name, feed = %best.url, tier = %best.tier, "Discovered feed");
        self.state.feed_url = Some(best.url.to_string());
        self.state.feed_etag = None;
        self.state.feed_last_modified = None;
        Ok(best.url)
    }

    fn forget_feed(&mut self) {
        self.state.feed_url = None;
        self.state.feed_etag = None;
        self.state.feed_last_modified = None;
    }

    async fn try_scrape(&mut self) -> Result<Vec<Post>, MonitorError> {
        let page_url = self.site_url()?;
        let (ctx, blog) = (self.ctx, self.blog);
        let request = FetchRequest::get(page_url.clone());
        let response = with_retry(ctx, &blog.name, || fetch_checked(ctx, &request)).await?;

        let html = String::from_utf8_lossy(&response.body);
        scrape_posts(ctx, blog, &html, &page_url)
    }

    fn finish(self) -> BlogReport {
        let Check {
            ctx,
            blog,
            prior,
            mut state,
            now,
            mut stages,
            mut issues,
            extraction,
            reminder_due,
        } = self;
        if stages.last() != Some(&Stage::Done) {
            stages.push(Stage::Done);
        }

        if blog.strategy == MonitoringStrategy::FeedReminder {
            return BlogReport {
                blog_name: blog.name.clone(),
                new_posts: Vec::new(),
                state,
                outcome: Outcome::Ok,
                issues,
                source: None,
                change: None,
                reminder_due,
                stages,
                persist: true,
            };
        }

        let (new_posts, source, change) = match extraction {
            Some(Extraction::Posts(posts, source)) => {
                let report = detect_changes(posts, prior.last_post.as_ref());
                if report.status != ChangeStatus::Empty {
                    state.last_post = report.latest.clone();
                    state.last_post_date = report.latest_date;
                }
                if report.status == ChangeStatus::Ambiguous {
                    issues.push(Issue {
                        kind: ErrorKind::AmbiguousState,
                        stage: Stage::Done,
                        message: "last seen post no longer listed; reporting only the newest"
                            .to_string(),
                    });
                }
                (report.new_posts, Some(source), Some(report.status))
            }
            Some(Extraction::NotModified) => {
                (Vec::new(), Some(Source::FeedNotModified), Some(ChangeStatus::Unchanged))
            }
            None => {
                let cut_short = issues.iter().any(|i| i.kind == ErrorKind::Deadline);
                if cut_short {
                    state = prior;
                } else {
                    let primary = issues
                        .iter()
                        .find(|i| i.kind == ErrorKind::SelectorBreak)
                        .or_else(|| issues.last());
                    state.last_checked_at = Some(now);
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    state.last_error = primary.map(|i| i.message.clone());
                    state.last_error_kind = primary.map(|i| i.kind);
                }
                tracing::warn!(
                    blog = %blog.name,
                    failures = state.consecutive_failures,
                    "Check failed"
                );
                return BlogReport {
                    blog_name: blog.name.clone(),
                    new_posts: Vec::new(),
                    state,
                    outcome: Outcome::Failed,
                    issues,
                    source: None,
                    change: None,
                    reminder_due: false,
                    stages,
                    persist: !cut_short,
                };
            }
        };

        state.last_checked_at = Some(now);
        state.last_success_at = Some(now);
        state.consecutive_failures = 0;
        state.last_error = None;
        state.last_error_kind = None;

        let recovering = prior.last_error_kind == Some(ErrorKind::SelectorBreak)
            || prior.consecutive_failures >= ctx.settings.failure_threshold;
        let outcome = if change == Some(ChangeStatus::Ambiguous) || recovering {
            Outcome::Degraded
        } else {
            Outcome::Ok
        };

        tracing::info!(
            blog = %blog.name,
            new_posts = new_posts.len(),
            source = ?source,
            outcome = ?outcome,
            "Checked blog"
        );

        BlogReport {
            blog_name: blog.name.clone(),
            new_posts,
            state,
            outcome,
            issues,
            source,
            change,
            reminder_due: false,
            stages,
            persist: true,
        }
    }
}

/// Waits for the host slot, fetches, and turns error statuses into errors.
async fn fetch_checked(
    ctx: &MonitorContext,
    request: &FetchRequest,
) -> Result<FetchResponse, MonitorError> {
    ctx.limiter.wait(&request.url).await;
    let response = ctx.fetcher.fetch(request).await?;
    let status = response.status;

    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .header_str(&RETRY_AFTER)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(MonitorError::RateLimited(retry_after));
    }
    Err(MonitorError::HttpStatus(status.as_u16()))
}

/// Picks the selector triple (blog config, override store, then detection)
/// and extracts posts. Synchronous so the parsed document never crosses an
/// await point.
fn scrape_posts(
    ctx: &MonitorContext,
    blog: &Blog,
    html: &str,
    page_url: &Url,
) -> Result<Vec<Post>, MonitorError> {
    let doc = Html::parse_document(html);

    let triple = match blog
        .selectors
        .clone()
        .or_else(|| ctx.overrides.lookup(blog).cloned())
    {
        Some(triple) => triple,
        None => {
            let best = detect(&doc, page_url).into_iter().next().ok_or_else(|| {
                MonitorError::SelectorBreak("no repeated post structure found".to_string())
            })?;
            if best.confidence < ctx.settings.min_confidence {
                return Err(MonitorError::SelectorBreak(format!(
                    "best detected selector {} has confidence {:.2}, below {:.2}",
                    best.container, best.confidence, ctx.settings.min_confidence
                )));
            }
            tracing::debug!(
                blog = %blog.name,
                container = %best.container,
                confidence = best.confidence,
                "Using detected selectors"
            );
            best.triple()
        }
    };

    extract_posts(&doc, page_url, &triple, &blog.name)
        .map_err(|e| MonitorError::SelectorBreak(e.to_string()))
}
