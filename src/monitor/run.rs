//! One monitoring run over every configured blog.
//!
//! States are loaded up front, blogs are checked through a bounded pool,
//! and the proposed states are written back one at a time once the pool
//! has drained. Only a total state-store outage aborts the run.
//! [`initialize`] drives the same pool to record baselines silently.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use super::hybrid::{check_blog, BlogReport, Outcome};
use super::{MonitorContext, MonitorError};
use crate::model::{Blog, BlogState, ErrorKind, MonitoringStrategy, Post};
use crate::storage::StateStore;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("State store unavailable: {0}")]
    StateStoreUnavailable(String),
}

/// A blog that ended the run degraded or failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attention {
    pub blog: String,
    pub outcome: Outcome,
    /// `None` when the blog's state could not be loaded
    pub kind: Option<ErrorKind>,
    pub reason: String,
    /// Selector break, or failures at the threshold: needs a manual fix
    pub escalate: bool,
}

/// What a run produced, handed to the [`NotificationSink`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Every checked blog, with its new posts newest first (possibly none)
    pub new_posts: BTreeMap<String, Vec<Post>>,
    pub outcomes: BTreeMap<String, Outcome>,
    pub attention: Vec<Attention>,
    /// Feed-reminder blogs due for a manual look
    pub reminders: Vec<String>,
    /// Problems with the run itself, such as failed state writes
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn total_new_posts(&self) -> usize {
        self.new_posts.values().map(Vec::len).sum()
    }

    fn record(&mut self, report: &BlogReport, failure_threshold: u32) {
        self.outcomes.insert(report.blog_name.clone(), report.outcome);
        self.new_posts
            .insert(report.blog_name.clone(), report.new_posts.clone());
        if report.reminder_due {
            self.reminders.push(report.blog_name.clone());
        }

        let escalate = report.needs_attention(failure_threshold);
        if report.outcome != Outcome::Ok || escalate {
            let primary = report.primary_issue();
            self.attention.push(Attention {
                blog: report.blog_name.clone(),
                outcome: report.outcome,
                kind: primary.map(|i| i.kind),
                reason: primary.map_or_else(String::new, |i| i.message.clone()),
                escalate,
            });
        }
    }
}

/// Consumer of run results (digest mail, chat hook, ...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, summary: &RunSummary);
}

/// Writes the summary to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, summary: &RunSummary) {
        for (blog, posts) in &summary.new_posts {
            for post in posts {
                tracing::info!(blog = %blog, title = %post.title, url = %post.url, "New post");
            }
        }
        for item in &summary.attention {
            tracing::warn!(
                blog = %item.blog,
                outcome = ?item.outcome,
                kind = ?item.kind,
                escalate = item.escalate,
                reason = %item.reason,
                "Blog needs attention"
            );
        }
        for blog in &summary.reminders {
            tracing::info!(blog = %blog, "Reminder: check this blog manually");
        }
        tracing::info!(
            blogs = summary.outcomes.len(),
            new_posts = summary.total_new_posts(),
            attention = summary.attention.len(),
            "Run complete"
        );
    }
}

/// Checks every blog and persists the resulting states.
///
/// Blogs whose state cannot be loaded are failed without being checked.
/// Blogs not started before the deadline are failed with a deadline issue
/// and keep their stored state.
///
/// # Errors
///
/// [`RunError::StateStoreUnavailable`] when no state at all could be loaded.
pub async fn run_all(
    ctx: &MonitorContext,
    blogs: &[Blog],
    store: &dyn StateStore,
    sink: &dyn NotificationSink,
) -> Result<RunSummary, RunError> {
    let mut summary = RunSummary::default();
    let runnable = load_states(blogs, store, &mut summary).await?;
    check_and_save(ctx, runnable, store, &mut summary).await;

    sink.notify(&summary).await;
    Ok(summary)
}

/// Which blogs [`initialize`] records a baseline for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    /// Only blogs without a recorded last post
    Missing,
    /// Every blog; posts not reported yet are marked as read
    MarkAllRead,
}

/// Records the current newest post of blogs as their baseline, without
/// notifying anyone. Feed-reminder blogs have no baseline and are skipped.
///
/// The returned summary never lists new posts.
///
/// # Errors
///
/// [`RunError::StateStoreUnavailable`] when no state at all could be loaded.
pub async fn initialize(
    ctx: &MonitorContext,
    blogs: &[Blog],
    store: &dyn StateStore,
    baseline: Baseline,
) -> Result<RunSummary, RunError> {
    let mut summary = RunSummary::default();
    let runnable: Vec<(&Blog, BlogState)> = load_states(blogs, store, &mut summary)
        .await?
        .into_iter()
        .filter(|(blog, prior)| {
            if blog.strategy == MonitoringStrategy::FeedReminder {
                return false;
            }
            if baseline == Baseline::Missing && prior.last_post.is_some() {
                tracing::debug!(blog = %blog.name, "Already initialized, skipping");
                return false;
            }
            true
        })
        .collect();

    check_and_save(ctx, runnable, store, &mut summary).await;

    let marked = summary.total_new_posts();
    for posts in summary.new_posts.values_mut() {
        posts.clear();
    }
    tracing::info!(
        blogs = summary.outcomes.len(),
        marked_read = marked,
        "Initialization complete"
    );
    Ok(summary)
}

/// Loads every blog's state. Load failures are recorded on `summary`.
async fn load_states<'b>(
    blogs: &'b [Blog],
    store: &dyn StateStore,
    summary: &mut RunSummary,
) -> Result<Vec<(&'b Blog, BlogState)>, RunError> {
    let mut runnable = Vec::with_capacity(blogs.len());
    let mut last_load_error = None;
    for blog in blogs {
        match store.load(&blog.name).await {
            Ok(state) => {
                let prior = state.unwrap_or_else(|| BlogState::new(&blog.name));
                runnable.push((blog, prior));
            }
            Err(e) => {
                tracing::error!(blog = %blog.name, error = %e, "Failed to load blog state");
                summary.outcomes.insert(blog.name.clone(), Outcome::Failed);
                summary.attention.push(Attention {
                    blog: blog.name.clone(),
                    outcome: Outcome::Failed,
                    kind: None,
                    reason: format!("state could not be loaded: {e}"),
                    escalate: false,
                });
                last_load_error = Some(e.to_string());
            }
        }
    }
    match last_load_error {
        Some(reason) if runnable.is_empty() => Err(RunError::StateStoreUnavailable(reason)),
        _ => Ok(runnable),
    }
}

/// Runs the worker pool, writes the states back and fills in `summary`.
async fn check_and_save(
    ctx: &MonitorContext,
    runnable: Vec<(&Blog, BlogState)>,
    store: &dyn StateStore,
    summary: &mut RunSummary,
) {
    let concurrency = ctx.settings.concurrency.max(1);
    let reports: Vec<BlogReport> = stream::iter(runnable)
        .map(|(blog, prior)| async move {
            if ctx.deadline_passed() {
                tracing::warn!(blog = %blog.name, "Run deadline reached before check started");
                return BlogReport::not_started(&blog.name, prior, &MonitorError::Deadline);
            }
            check_blog(ctx, blog, prior).await
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    // Single writer, after every worker is done
    for report in &reports {
        if !report.persist {
            continue;
        }
        if let Err(e) = store.save(&report.blog_name, &report.state).await {
            tracing::error!(blog = %report.blog_name, error = %e, "Failed to save blog state");
            summary
                .warnings
                .push(format!("state for '{}' not saved: {e}", report.blog_name));
        }
    }

    for report in &reports {
        summary.record(report, ctx.settings.failure_threshold);
    }
    summary.attention.sort_by(|a, b| a.blog.cmp(&b.blog));
    summary.reminders.sort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::stub::StubFetcher;
    use crate::fetch::Fetch;
    use crate::model::PostIdentity;
    use crate::monitor::MonitorSettings;
    use crate::storage::{MemoryStore, StoreError};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;

    const SITE_A: &str = "https://a.example.com/";
    const SITE_B: &str = "https://b.example.com/";

    const PAGE_V1: &str = r#"<main>
        <article class="post"><h2><a href="/p/2">Two</a></h2></article>
        <article class="post"><h2><a href="/p/1">One</a></h2></article>
        <article class="post"><h2><a href="/p/0">Zero</a></h2></article>
    </main>"#;

    const PAGE_V2: &str = r#"<main>
        <article class="post"><h2><a href="/p/3">Three</a></h2></article>
        <article class="post"><h2><a href="/p/2">Two</a></h2></article>
        <article class="post"><h2><a href="/p/1">One</a></h2></article>
        <article class="post"><h2><a href="/p/0">Zero</a></h2></article>
    </main>"#;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<RunSummary>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, summary: &RunSummary) {
            self.seen.lock().unwrap().push(summary.clone());
        }
    }

    /// Store whose loads fail for the named blogs (or all) and whose saves may fail.
    struct FlakyStore {
        inner: MemoryStore,
        broken_loads: Vec<&'static str>,
        all_loads_fail: bool,
        saves_fail: bool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                broken_loads: Vec::new(),
                all_loads_fail: false,
                saves_fail: false,
            }
        }
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn load(&self, name: &str) -> Result<Option<BlogState>, StoreError> {
            if self.all_loads_fail || self.broken_loads.iter().any(|b| *b == name) {
                return Err(StoreError::Unavailable("disk on fire".to_string()));
            }
            self.inner.load(name).await
        }

        async fn save(&self, name: &str, state: &BlogState) -> Result<(), StoreError> {
            if self.saves_fail {
                return Err(StoreError::Unavailable("read-only".to_string()));
            }
            self.inner.save(name, state).await
        }
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            request_delay: Duration::ZERO,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
            run_deadline: None,
            ..MonitorSettings::default()
        }
    }

    fn ctx(stub: StubFetcher) -> MonitorContext {
        let fetcher: Arc<dyn Fetch> = Arc::new(stub);
        MonitorContext::new(fetcher, settings())
    }

    fn scrape_blog(name: &str, url: &str) -> Blog {
        Blog::new(name, url).with_strategy(MonitoringStrategy::Scrape)
    }

    #[tokio::test]
    async fn test_second_run_reports_new_post() {
        let stub = StubFetcher::new().html(SITE_A, PAGE_V1).html(SITE_A, PAGE_V2);
        let ctx = ctx(stub);
        let blogs = vec![scrape_blog("a", SITE_A)];
        let store = MemoryStore::new();
        let sink = RecordingSink::default();

        let first = run_all(&ctx, &blogs, &store, &sink).await.unwrap();
        assert_eq!(first.total_new_posts(), 0);
        assert_eq!(first.outcomes["a"], Outcome::Ok);

        let second = run_all(&ctx, &blogs, &store, &sink).await.unwrap();
        let titles: Vec<&str> = second.new_posts["a"].iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Three"]);

        let stored = store.load("a").await.unwrap().unwrap();
        assert_eq!(
            stored.last_post,
            Some(PostIdentity::new("https://a.example.com/p/3", "Three"))
        );
        assert_eq!(sink.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_one_failing_blog_does_not_stop_others() {
        let stub = StubFetcher::new().html(SITE_A, PAGE_V1).status(SITE_B, 503);
        let ctx = ctx(stub);
        let blogs = vec![scrape_blog("a", SITE_A), scrape_blog("b", SITE_B)];
        let store = MemoryStore::new();

        let summary = run_all(&ctx, &blogs, &store, &LogSink).await.unwrap();

        assert_eq!(summary.outcomes["a"], Outcome::Ok);
        assert_eq!(summary.outcomes["b"], Outcome::Failed);
        assert_eq!(summary.attention.len(), 1);
        assert_eq!(summary.attention[0].blog, "b");
        assert_eq!(summary.attention[0].kind, Some(ErrorKind::Network));
        assert!(!summary.attention[0].escalate);

        let b = store.load("b").await.unwrap().unwrap();
        assert_eq!(b.consecutive_failures, 1);
        assert_eq!(b.last_error_kind, Some(ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_failure_threshold_escalates() {
        let stub = StubFetcher::new().status(SITE_B, 500);
        let ctx = ctx(stub);
        let blogs = vec![scrape_blog("b", SITE_B)];
        let store = MemoryStore::new();
        let mut prior = BlogState::new("b");
        prior.consecutive_failures = 2;
        store.save("b", &prior).await.unwrap();

        let summary = run_all(&ctx, &blogs, &store, &LogSink).await.unwrap();
        assert!(summary.attention[0].escalate);
        assert_eq!(store.load("b").await.unwrap().unwrap().consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_deadline_fails_unstarted_blogs_without_saving() {
        let stub = StubFetcher::new().html(SITE_A, PAGE_V1);
        let ctx = ctx(stub).with_deadline(Some(Instant::now()));
        let blogs = vec![scrape_blog("a", SITE_A)];
        let store = MemoryStore::new();

        let summary = run_all(&ctx, &blogs, &store, &LogSink).await.unwrap();

        assert_eq!(summary.outcomes["a"], Outcome::Failed);
        assert_eq!(summary.attention[0].kind, Some(ErrorKind::Deadline));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_single_load_failure_fails_only_that_blog() {
        let stub = StubFetcher::new().html(SITE_A, PAGE_V1);
        let ctx = ctx(stub);
        let blogs = vec![scrape_blog("a", SITE_A), scrape_blog("b", SITE_B)];
        let mut store = FlakyStore::new();
        store.broken_loads = vec!["b"];

        let summary = run_all(&ctx, &blogs, &store, &LogSink).await.unwrap();

        assert_eq!(summary.outcomes["a"], Outcome::Ok);
        assert_eq!(summary.outcomes["b"], Outcome::Failed);
        assert_eq!(summary.attention[0].kind, None);
        assert!(!summary.new_posts.contains_key("b"));
    }

    #[tokio::test]
    async fn test_total_store_outage_aborts() {
        let ctx = ctx(StubFetcher::new());
        let blogs = vec![scrape_blog("a", SITE_A), scrape_blog("b", SITE_B)];
        let mut store = FlakyStore::new();
        store.all_loads_fail = true;
        let sink = RecordingSink::default();

        let err = run_all(&ctx, &blogs, &store, &sink).await.unwrap_err();
        assert!(matches!(err, RunError::StateStoreUnavailable(_)));
        assert!(sink.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_save_becomes_warning() {
        let stub = StubFetcher::new().html(SITE_A, PAGE_V1);
        let ctx = ctx(stub);
        let blogs = vec![scrape_blog("a", SITE_A)];
        let mut store = FlakyStore::new();
        store.saves_fail = true;

        let summary = run_all(&ctx, &blogs, &store, &LogSink).await.unwrap();
        assert_eq!(summary.outcomes["a"], Outcome::Ok);
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].contains("'a'"));
    }

    #[tokio::test]
    async fn test_due_reminders_are_listed() {
        let ctx = ctx(StubFetcher::new());
        let blogs = vec![
            Blog::new("manual", SITE_A).with_strategy(MonitoringStrategy::FeedReminder),
        ];
        let store = MemoryStore::new();

        let summary = run_all(&ctx, &blogs, &store, &LogSink).await.unwrap();
        assert_eq!(summary.reminders, vec!["manual".to_string()]);

        // Checked moments ago, so not due again
        let again = run_all(&ctx, &blogs, &store, &LogSink).await.unwrap();
        assert!(again.reminders.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_skips_blogs_with_a_baseline() {
        let stub = Arc::new(StubFetcher::new().html(SITE_A, PAGE_V2).html(SITE_B, PAGE_V1));
        let fetcher: Arc<dyn Fetch> = stub.clone();
        let ctx = MonitorContext::new(fetcher, settings());
        let blogs = vec![
            scrape_blog("a", SITE_A),
            scrape_blog("b", SITE_B),
            Blog::new("manual", SITE_A).with_strategy(MonitoringStrategy::FeedReminder),
        ];
        let store = MemoryStore::new();
        let mut known = BlogState::new("a");
        known.last_post = Some(PostIdentity::new("https://a.example.com/p/1", "One"));
        store.save("a", &known).await.unwrap();

        let summary = initialize(&ctx, &blogs, &store, Baseline::Missing).await.unwrap();

        assert_eq!(summary.outcomes.keys().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(stub.calls_to(SITE_A), 0);
        assert_eq!(store.load("a").await.unwrap().unwrap(), known);
        let b = store.load("b").await.unwrap().unwrap();
        assert_eq!(b.last_post, Some(PostIdentity::new("https://b.example.com/p/2", "Two")));
        assert!(store.load("manual").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_mark_all_read_swallows_new_posts() {
        let stub = StubFetcher::new().html(SITE_A, PAGE_V2);
        let ctx = ctx(stub);
        let blogs = vec![scrape_blog("a", SITE_A)];
        let store = MemoryStore::new();
        let mut known = BlogState::new("a");
        known.last_post = Some(PostIdentity::new("https://a.example.com/p/1", "One"));
        store.save("a", &known).await.unwrap();
        let sink = RecordingSink::default();

        let summary = initialize(&ctx, &blogs, &store, Baseline::MarkAllRead)
            .await
            .unwrap();
        assert_eq!(summary.total_new_posts(), 0);
        assert_eq!(summary.outcomes["a"], Outcome::Ok);
        let stored = store.load("a").await.unwrap().unwrap();
        assert_eq!(
            stored.last_post,
            Some(PostIdentity::new("https://a.example.com/p/3", "Three"))
        );

        // Nothing is left to report afterwards
        let next = run_all(&ctx, &blogs, &store, &sink).await.unwrap();
        assert_eq!(next.total_new_posts(), 0);
    }

    #[tokio::test]
    async fn test_empty_blog_list() {
        let ctx = ctx(StubFetcher::new());
        let summary = run_all(&ctx, &[], &MemoryStore::new(), &LogSink).await.unwrap();
        assert!(summary.outcomes.is_empty());
    }
}
