//! Configuration file parser for `~/.config/blogwatch/config.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`
//! (no blogs, default tunables). Unknown top-level keys are accepted but
//! logged as warnings, since they are usually typos.
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::model::{Blog, SelectorTriple};
use crate::monitor::MonitorSettings;
use crate::util::{normalize_url, validate_url};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Blog '{0}' is configured more than once")]
    DuplicateBlog(String),

    #[error("Blog '{blog}' has an unusable URL: {reason}")]
    InvalidBlogUrl { blog: String, reason: String },

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Attempts per fetch, including the first
    pub retry_count: u32,
    /// Consecutive failures before a blog needs attention
    pub failure_threshold: u32,
    /// Blogs checked at once
    pub concurrency: usize,
    /// Minimum spacing between requests to the same host
    pub request_delay_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Wall-clock budget for a whole run. 0 = unbounded.
    pub run_deadline_secs: u64,
    /// Detected selectors scoring below this are rejected
    pub min_confidence: f64,
    pub reminder_interval_days: i64,
    pub user_agent: String,

    pub blogs: Vec<Blog>,

    /// Selector overrides keyed by blog name, domain or full URL
    pub selectors: HashMap<String, SelectorTriple>,
}

impl Default for Config {
    fn default() -> Self {
        let settings = MonitorSettings::default();
        Self {
            retry_count: settings.retry_count,
            failure_threshold: settings.failure_threshold,
            concurrency: settings.concurrency,
            request_delay_ms: millis(settings.request_delay),
            backoff_base_ms: millis(settings.backoff_base),
            backoff_max_ms: millis(settings.backoff_max),
            timeout_secs: 30,
            run_deadline_secs: settings.run_deadline.map_or(0, |d| d.as_secs()),
            min_confidence: settings.min_confidence,
            reminder_interval_days: settings.reminder_interval_days,
            user_agent: concat!("blogwatch/", env!("CARGO_PKG_VERSION")).to_string(),
            blogs: Vec::new(),
            selectors: HashMap::new(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 13] = [
        "retry_count",
        "failure_threshold",
        "concurrency",
        "request_delay_ms",
        "backoff_base_ms",
        "backoff_max_ms",
        "timeout_secs",
        "run_deadline_secs",
        "min_confidence",
        "reminder_interval_days",
        "user_agent",
        "blogs",
        "selectors",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    ///
    /// The result is not validated; call [`Config::validate`] before use.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Size check before reading
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::parse(&content)?;
        tracing::info!(
            path = %path.display(),
            blogs = config.blogs.len(),
            overrides = config.selectors.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration text. Blank input yields the defaults.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        Ok(toml::from_str(content)?)
    }

    /// Reject configurations the monitor cannot run safely.
    ///
    /// Blog names must be unique (they key persisted state) and every blog
    /// URL must be public http(s).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for blog in &self.blogs {
            if !seen.insert(blog.name.as_str()) {
                return Err(ConfigError::DuplicateBlog(blog.name.clone()));
            }
            validate_url(&blog.url).map_err(|e| ConfigError::InvalidBlogUrl {
                blog: blog.name.clone(),
                reason: e.to_string(),
            })?;
        }

        if self.concurrency == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry_count == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "retry_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::InvalidSetting {
                key: "min_confidence",
                reason: format!("{} is outside 0.0..=1.0", self.min_confidence),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            retry_count: self.retry_count,
            failure_threshold: self.failure_threshold,
            concurrency: self.concurrency,
            request_delay: Duration::from_millis(self.request_delay_ms),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            min_confidence: self.min_confidence,
            reminder_interval_days: self.reminder_interval_days,
            run_deadline: (self.run_deadline_secs > 0)
                .then(|| Duration::from_secs(self.run_deadline_secs)),
        }
    }

    pub fn override_store(&self) -> OverrideStore {
        let mut store = OverrideStore::default();
        for (key, triple) in &self.selectors {
            store.insert(key.clone(), triple.clone());
        }
        store
    }
}

// ============================================================================
// Selector overrides
// ============================================================================

/// Hand-maintained selectors for sites where detection is known to fail.
///
/// Keys are a blog name, a bare domain (`example.com`) or a full URL.
/// Lookup tries them in that order.
#[derive(Debug, Clone, Default)]
pub struct OverrideStore {
    entries: HashMap<String, SelectorTriple>,
}

impl OverrideStore {
    pub fn insert(&mut self, key: impl Into<String>, triple: SelectorTriple) {
        let key = key.into();
        let key = if key.contains("://") {
            normalize_url(&key)
        } else {
            key.trim().to_string()
        };
        self.entries.insert(key, triple);
    }

    pub fn lookup(&self, blog: &Blog) -> Option<&SelectorTriple> {
        self.entries
            .get(&blog.name)
            .or_else(|| {
                let url = Url::parse(&blog.url).ok()?;
                let host = url.host_str()?.to_ascii_lowercase();
                self.entries
                    .get(&host)
                    .or_else(|| self.entries.get(host.trim_start_matches("www.")))
            })
            .or_else(|| self.entries.get(&normalize_url(&blog.url)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
