//! Heuristic detection of the selectors that isolate post entries.
//!
//! Each strategy in [`STRATEGIES`] is a pure function proposing container
//! selectors for a document. Every proposal is then evaluated the same way:
//! pick title and link selectors, extract a sample from every instance and
//! score the sample. Strategies never score themselves.

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use url::Url;

use super::document_base;
use super::extractor::{text_of, CompiledTriple};
use crate::model::{SelectorTriple, SELF_SELECTOR};
use crate::util::{is_same_host, resolve_url};

/// A strategy proposes container selectors, most promising first.
pub type Strategy = fn(&Html) -> Vec<String>;

pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("class-pattern", class_pattern),
    ("semantic-tag", semantic_tag),
    ("repeated-signature", repeated_signature),
];

/// At most this many candidates are returned
pub const MAX_CANDIDATES: usize = 3;

/// Class tokens that commonly mark a post entry.
const POST_CLASS_TOKENS: &[&str] = &["post", "entry", "article", "blog-post", "hentry", "story"];

/// Tags considered by the repeated-signature strategy.
const BLOCK_TAGS: &str = "article, div, section, li";

/// Minimum recurrences for a repeated signature.
const MIN_REPEATS: usize = 3;

const TITLE_SELECTORS: &[&str] = &[
    "h1", "h2", "h3", "h4", ".post-title", ".entry-title", ".title", "a[href]",
];

const LINK_SELECTORS: &[&str] = &[
    "h1 a[href]",
    "h2 a[href]",
    "h3 a[href]",
    ".post-title a[href]",
    ".entry-title a[href]",
    "a[href^='/']",
    "a[href]",
];

const CHROME_TAGS: &[&str] = &["nav", "footer", "header", "aside"];
const CHROME_HINTS: &[&str] = &["nav", "menu", "footer", "sidebar"];

// Score weights; they sum to 1.
const W_REPETITION: f64 = 0.35;
const W_TEXT: f64 = 0.2;
const W_DISTINCT_TITLES: f64 = 0.2;
const W_DISTINCT_HREFS: f64 = 0.25;
const REPETITION_CAP: usize = 10;
const CHROME_PENALTY: f64 = 0.5;
const COLLISION_PENALTY: f64 = 0.3;
const MAX_TITLE_CHARS: usize = 200;

/// A scored selector proposal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectorCandidate {
    pub container: String,
    pub title: String,
    pub link: String,
    pub confidence: f64,
    /// Number of container instances on the page
    pub sample_count: usize,
    /// Name of the strategy that proposed the container
    pub strategy: &'static str,
}

impl SelectorCandidate {
    pub fn triple(&self) -> SelectorTriple {
        SelectorTriple::new(&self.container, &self.title, &self.link)
    }

    fn specificity(&self) -> usize {
        self.container.matches(|c| c == '.' || c == '#').count()
    }
}

/// Runs every strategy in [`STRATEGIES`] and returns the best candidates.
///
/// `page_url` decides which links are internal to the site.
pub fn detect(doc: &Html, page_url: &Url) -> Vec<SelectorCandidate> {
    detect_with(doc, page_url, STRATEGIES)
}

/// Like [`detect`] with an explicit strategy list.
///
/// Candidates are deduplicated by triple (first proposer wins), sorted by
/// confidence, then by container specificity, then lexically, and capped at
/// [`MAX_CANDIDATES`].
pub fn detect_with(
    doc: &Html,
    page_url: &Url,
    strategies: &[(&'static str, Strategy)],
) -> Vec<SelectorCandidate> {
    let mut candidates: Vec<SelectorCandidate> = Vec::new();

    for (name, strategy) in strategies {
        for container in strategy(doc) {
            let Some(candidate) = evaluate(doc, page_url, &container, *name) else {
                continue;
            };
            if candidates.iter().all(|c| c.triple() != candidate.triple()) {
                candidates.push(candidate);
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| b.specificity().cmp(&a.specificity()))
            .then_with(|| a.container.cmp(&b.container))
    });
    candidates.truncate(MAX_CANDIDATES);

    tracing::debug!(
        candidates = candidates.len(),
        best = candidates.first().map(|c| c.container.as_str()).unwrap_or("none"),
        "Selector detection finished"
    );
    candidates
}

// ============================================================================
// Strategies
// ============================================================================

/// `tag.token` for elements carrying a well-known post class token.
pub fn class_pattern(doc: &Html) -> Vec<String> {
    let Ok(sel) = Selector::parse("[class]") else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for el in doc.select(&sel) {
        for class in el.value().classes() {
            if POST_CLASS_TOKENS.contains(&class) {
                let selector = format!("{}.{}", el.value().name(), class);
                if !out.contains(&selector) {
                    out.push(selector);
                }
            }
        }
    }
    out
}

/// HTML5 `<article>` elements.
pub fn semantic_tag(doc: &Html) -> Vec<String> {
    match Selector::parse("article") {
        Ok(sel) if doc.select(&sel).next().is_some() => vec!["article".to_string()],
        _ => Vec::new(),
    }
}

/// Block elements sharing tag and class set that recur at one depth.
pub fn repeated_signature(doc: &Html) -> Vec<String> {
    let Ok(sel) = Selector::parse(BLOCK_TAGS) else {
        return Vec::new();
    };

    let mut counts: HashMap<(usize, String), usize> = HashMap::new();
    let mut order: Vec<(usize, String)> = Vec::new();

    for el in doc.select(&sel) {
        let mut classes: Vec<&str> = el.value().classes().collect();
        if classes.is_empty() {
            continue;
        }
        classes.sort_unstable();
        classes.dedup();

        let key = (
            el.ancestors().count(),
            format!("{}.{}", el.value().name(), classes.join(".")),
        );
        let count = counts.entry(key.clone()).or_insert(0);
        if *count == 0 {
            order.push(key);
        }
        *count += 1;
    }

    let mut out: Vec<String> = Vec::new();
    for key in order {
        let (_, selector) = &key;
        if counts[&key] >= MIN_REPEATS
            && !out.contains(selector)
            && Selector::parse(selector).is_ok()
        {
            out.push(selector.clone());
        }
    }
    out
}

// ============================================================================
// Evaluation
// ============================================================================

/// One extracted (title, href) pair used for scoring.
#[derive(Debug, Clone)]
pub(crate) struct Sample {
    pub title: String,
    pub href: Option<String>,
    pub in_chrome: bool,
}

/// Chooses title/link selectors for a container and scores the result.
///
/// The link selector must reach an internal link (same host as `page_url`)
/// first; when none does, plain `a[href]` is used. Returns `None` when the
/// container selector is invalid or matches nothing.
pub fn evaluate(
    doc: &Html,
    page_url: &Url,
    container: &str,
    strategy: &'static str,
) -> Option<SelectorCandidate> {
    let sel = Selector::parse(container).ok()?;
    let instances: Vec<ElementRef<'_>> = doc.select(&sel).collect();
    if instances.is_empty() {
        return None;
    }

    let base = document_base(doc, page_url);
    let internal =
        |href: &str| resolve_url(href, &base).is_some_and(|u| is_same_host(page_url, &u));

    let anchors = instances.iter().all(|el| el.value().name() == "a");
    let (title, link) = if anchors {
        (SELF_SELECTOR, SELF_SELECTOR)
    } else {
        (
            pick(&instances, TITLE_SELECTORS, |el, sel| {
                el.select(sel).any(|m| !text_of(m).is_empty())
            })
            .unwrap_or(SELF_SELECTOR),
            // Extraction takes the first href, so that one must be internal
            pick(&instances, LINK_SELECTORS, |el, sel| {
                el.select(sel)
                    .find_map(|a| a.value().attr("href"))
                    .is_some_and(internal)
            })
            .unwrap_or("a[href]"),
        )
    };

    let triple = SelectorTriple::new(container, title, link);
    let compiled = CompiledTriple::compile(&triple).ok()?;
    let samples: Vec<Sample> = instances
        .iter()
        .map(|el| Sample {
            title: compiled.title_text(*el),
            href: compiled.href(*el).map(str::to_owned),
            in_chrome: in_chrome(*el),
        })
        .collect();

    Some(SelectorCandidate {
        container: triple.container,
        title: triple.title,
        link: triple.link,
        confidence: score(&samples),
        sample_count: instances.len(),
        strategy,
    })
}

/// First selector that is usable in at least half the instances.
fn pick<'s>(
    instances: &[ElementRef<'_>],
    selectors: &[&'s str],
    usable: impl Fn(ElementRef<'_>, &Selector) -> bool,
) -> Option<&'s str> {
    selectors.iter().copied().find(|candidate| {
        let Ok(sel) = Selector::parse(candidate) else {
            return false;
        };
        let hits = instances
            .iter()
            .filter(|el| usable(**el, &sel))
            .count();
        hits * 2 >= instances.len()
    })
}

/// Whether the element or any ancestor is site navigation or page chrome.
fn in_chrome(el: ElementRef<'_>) -> bool {
    std::iter::once(el)
        .chain(el.ancestors().filter_map(ElementRef::wrap))
        .any(|node| {
            let v = node.value();
            CHROME_TAGS.contains(&v.name())
                || v.classes().chain(v.id()).any(|token| {
                    let token = token.to_ascii_lowercase();
                    CHROME_HINTS.iter().any(|hint| token.contains(hint))
                })
        })
}

fn text_ok(title: &str) -> bool {
    !title.is_empty()
        && title.chars().count() <= MAX_TITLE_CHARS
        && title.chars().any(char::is_alphanumeric)
}

/// Confidence in `[0, 1]` for a set of extracted samples.
pub(crate) fn score(samples: &[Sample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f64;

    let titled: Vec<&Sample> = samples.iter().filter(|s| !s.title.is_empty()).collect();
    let distinguishable: HashSet<(&str, Option<&str>)> = titled
        .iter()
        .map(|s| (s.title.as_str(), s.href.as_deref()))
        .collect();
    let distinct_titles: HashSet<&str> = titled.iter().map(|s| s.title.as_str()).collect();
    let distinct_hrefs: HashSet<&str> = samples.iter().filter_map(|s| s.href.as_deref()).collect();
    let text_ok_count = samples.iter().filter(|s| text_ok(&s.title)).count();
    let chrome_count = samples.iter().filter(|s| s.in_chrome).count();

    let repetition = distinguishable.len().min(REPETITION_CAP) as f64 / REPETITION_CAP as f64;
    let mut confidence = W_REPETITION * repetition
        + W_TEXT * (text_ok_count as f64 / n)
        + W_DISTINCT_TITLES * (distinct_titles.len() as f64 / n)
        + W_DISTINCT_HREFS * (distinct_hrefs.len() as f64 / n);

    confidence *= 1.0 - CHROME_PENALTY * (chrome_count as f64 / n);
    if samples.len() > 1 && distinct_titles.len() == 1 && titled.len() == samples.len() {
        confidence *= COLLISION_PENALTY;
    }
    confidence.clamp(0.0, 1.0)
}
