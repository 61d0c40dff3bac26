//! Domain types shared by the detection pipeline, the monitor and storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::util::{clean_text, normalize_url};

/// Selector value meaning "use the container element itself".
pub const SELF_SELECTOR: &str = "self";

// ============================================================================
// Posts
// ============================================================================

/// A single blog post, from either a feed or a scraped page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub title: String,
    /// Absolute URL of the post
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub excerpt: Option<String>,
    /// Name of the blog this post was found on
    pub source_blog: String,
}

impl Post {
    pub fn identity(&self) -> PostIdentity {
        PostIdentity::new(&self.url, &self.title)
    }
}

/// Comparison key for posts: normalized URL plus cleaned title.
///
/// Two posts are the same entry iff both components match, so a post that
/// is re-titled or moved counts as new.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostIdentity {
    pub url: String,
    pub title: String,
}

impl PostIdentity {
    pub fn new(url: &str, title: &str) -> Self {
        Self {
            url: normalize_url(url),
            title: clean_text(title),
        }
    }
}

impl fmt::Display for PostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" <{}>", self.title, self.url)
    }
}

// ============================================================================
// Blogs
// ============================================================================

/// How a blog is watched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitoringStrategy {
    /// Scrape the page only; never look for a feed
    Scrape,
    /// Never fetch; remind the user to check manually every couple of weeks
    #[serde(alias = "feed")]
    FeedReminder,
    /// Prefer the feed, fall back to scraping
    #[default]
    Hybrid,
}

/// CSS selectors isolating repeated post entries on a page.
///
/// `title` and `link` may be [`SELF_SELECTOR`] to read the text / `href`
/// straight off the container element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectorTriple {
    pub container: String,
    #[serde(default = "default_title_selector")]
    pub title: String,
    #[serde(default = "default_link_selector")]
    pub link: String,
}

fn default_title_selector() -> String {
    "h1, h2, h3, h4, a[href]".to_string()
}

fn default_link_selector() -> String {
    "a[href]".to_string()
}

impl SelectorTriple {
    pub fn new(
        container: impl Into<String>,
        title: impl Into<String>,
        link: impl Into<String>,
    ) -> Self {
        Self {
            container: container.into(),
            title: title.into(),
            link: link.into(),
        }
    }

    /// `container` with the default title and link selectors.
    pub fn with_container(container: impl Into<String>) -> Self {
        Self::new(container, default_title_selector(), default_link_selector())
    }
}

impl fmt::Display for SelectorTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} | {} | {})", self.container, self.title, self.link)
    }
}

/// A configured blog. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blog {
    /// Unique key
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub strategy: MonitoringStrategy,
    /// Per-blog selector override; beats the override store and detection
    #[serde(default)]
    pub selectors: Option<SelectorTriple>,
}

impl Blog {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            strategy: MonitoringStrategy::default(),
            selectors: None,
        }
    }

    pub fn with_strategy(mut self, strategy: MonitoringStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_selectors(mut self, selectors: SelectorTriple) -> Self {
        self.selectors = Some(selectors);
        self
    }
}

// ============================================================================
// Errors and state
// ============================================================================

/// Classification of everything that can go wrong while checking a blog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connect/timeout/DNS or retryable HTTP status
    Network,
    /// Unparseable feed or page
    MalformedContent,
    /// Selectors match nothing (or only duplicates); needs a config change
    SelectorBreak,
    /// No feed found, or the feed path failed; triggers the scrape fallback
    FeedUnavailable,
    /// Stored last post no longer present in fresh results
    AmbiguousState,
    /// Run deadline reached before the blog could be checked
    Deadline,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::MalformedContent => "malformed_content",
            ErrorKind::SelectorBreak => "selector_break",
            ErrorKind::FeedUnavailable => "feed_unavailable",
            ErrorKind::AmbiguousState => "ambiguous_state",
            ErrorKind::Deadline => "deadline",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(ErrorKind::Network),
            "malformed_content" => Ok(ErrorKind::MalformedContent),
            "selector_break" => Ok(ErrorKind::SelectorBreak),
            "feed_unavailable" => Ok(ErrorKind::FeedUnavailable),
            "ambiguous_state" => Ok(ErrorKind::AmbiguousState),
            "deadline" => Ok(ErrorKind::Deadline),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// Persisted per-blog monitoring state.
///
/// The monitor only reads it and proposes the post-run value; writing it is
/// the [`StateStore`](crate::storage::StateStore)'s job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlogState {
    pub blog_name: String,
    /// Newest post seen on the last successful check
    pub last_post: Option<PostIdentity>,
    pub last_post_date: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Cached feed URL from discovery
    pub feed_url: Option<String>,
    pub feed_etag: Option<String>,
    pub feed_last_modified: Option<DateTime<Utc>>,
    /// Human-readable reason of the most recent failure
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
}

impl BlogState {
    pub fn new(blog_name: impl Into<String>) -> Self {
        Self {
            blog_name: blog_name.into(),
            ..Self::default()
        }
    }
}
