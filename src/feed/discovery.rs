use scraper::{Html, Selector};
use std::collections::HashMap;
use std::fmt;
use url::Url;

use crate::feed::parser::sniff_dialect;
use crate::fetch::{Fetch, FetchRequest, FetchResponse, HostLimiter};
use crate::scrape::document_base;
use crate::util::{clean_text, is_same_host, normalize_url, resolve_url, validate_url};

/// Conventional feed locations probed relative to the site root.
pub const PROBE_PATHS: &[&str] = &["/feed", "/rss", "/rss.xml", "/atom.xml", "/index.xml", "/feed.xml"];

/// Content types that announce a feed.
pub(crate) const FEED_MIME_TYPES: &[&str] = &[
    "application/rss+xml",
    "application/atom+xml",
    "application/rdf+xml",
    "application/xml",
    "text/xml",
];

/// URL fragments that make an in-page anchor look like a feed link.
const FEED_URL_HINTS: &[&str] = &["feed", "rss", "atom", ".xml"];

/// How a candidate was found, worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeedTier {
    /// `<a href>` in the page body with a feed-like URL that serves a feed
    Anchor,
    /// Probed path with either a feed content type or a feed root element
    ProbedXml,
    /// Probed path with both a feed content type and a feed root element
    ProbedFeed,
    /// `<link rel="alternate">` in the page head that serves a feed
    Declared,
}

impl fmt::Display for FeedTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedTier::Anchor => "anchor",
            FeedTier::ProbedXml => "probed-xml",
            FeedTier::ProbedFeed => "probed-feed",
            FeedTier::Declared => "declared",
        };
        f.write_str(name)
    }
}

/// A feed URL found for a site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedCandidate {
    pub url: Url,
    pub title: Option<String>,
    pub tier: FeedTier,
}

/// Finds feed URLs for a site, best first.
///
/// Scans the page for declared `<link rel="alternate">` feeds and feed-like
/// anchors, then probes [`PROBE_PATHS`]. Every candidate is fetched and kept
/// only if it answers with a feed content type or a feed root element; a URL
/// found twice is fetched once. Duplicates (by normalized URL) keep their
/// best tier; equal tiers keep discovery order. Candidates on another host
/// must pass [`validate_url`] before they are fetched.
///
/// Never fails: every fetch problem is logged and yields fewer candidates.
pub async fn discover_feeds(
    fetcher: &dyn Fetch,
    limiter: &HostLimiter,
    site: &Url,
) -> Vec<FeedCandidate> {
    let mut found = Vec::new();
    let mut linked = Vec::new();

    match get(fetcher, limiter, site).await {
        Some(resp) if resp.status.is_success() => {
            if sniff_dialect(&resp.body).is_some() {
                // The configured URL is itself a feed
                found.push(FeedCandidate {
                    url: site.clone(),
                    title: None,
                    tier: FeedTier::Declared,
                });
            } else {
                let html = String::from_utf8_lossy(&resp.body);
                let (declared, anchors) = scan_page(&html, site);
                linked.extend(declared);
                linked.extend(anchors);
            }
        }
        Some(resp) => {
            tracing::debug!(url = %site, status = resp.status.as_u16(), "Site page unavailable for feed discovery");
        }
        None => {}
    }

    // Verdict per normalized URL
    let mut probed: HashMap<String, Option<FeedTier>> = HashMap::new();

    for candidate in linked {
        if !allowed(site, &candidate.url) {
            continue;
        }
        if confirm(fetcher, limiter, &candidate.url, &mut probed).await.is_some() {
            found.push(candidate);
        } else {
            tracing::debug!(url = %candidate.url, tier = %candidate.tier, "Linked feed does not serve a feed");
        }
    }

    for path in PROBE_PATHS {
        let Ok(probe_url) = site.join(path) else {
            continue;
        };
        if let Some(tier) = confirm(fetcher, limiter, &probe_url, &mut probed).await {
            found.push(FeedCandidate {
                url: probe_url,
                title: None,
                tier,
            });
        }
    }

    let ranked = rank(site, found);
    tracing::debug!(url = %site, candidates = ranked.len(), "Feed discovery finished");
    ranked
}

async fn get(fetcher: &dyn Fetch, limiter: &HostLimiter, url: &Url) -> Option<FetchResponse> {
    limiter.wait(url).await;
    match fetcher.fetch(&FetchRequest::get(url.clone())).await {
        Ok(resp) => Some(resp),
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Discovery request failed");
            None
        }
    }
}

async fn confirm(
    fetcher: &dyn Fetch,
    limiter: &HostLimiter,
    url: &Url,
    probed: &mut HashMap<String, Option<FeedTier>>,
) -> Option<FeedTier> {
    let key = normalize_url(url.as_str());
    if let Some(verdict) = probed.get(&key) {
        return *verdict;
    }
    let verdict = probe(fetcher, limiter, url).await;
    probed.insert(key, verdict);
    verdict
}

/// Fetches `url` and grades it as a probed feed, or `None` if it is not one.
async fn probe(fetcher: &dyn Fetch, limiter: &HostLimiter, url: &Url) -> Option<FeedTier> {
    let resp = get(fetcher, limiter, url).await?;
    if !resp.status.is_success() {
        return None;
    }
    let content_type = resp.content_type();
    let xml_type = FEED_MIME_TYPES.iter().any(|t| content_type.contains(t));
    let feed_root = sniff_dialect(&resp.body).is_some();

    match (xml_type, feed_root) {
        (true, true) => Some(FeedTier::ProbedFeed),
        (true, false) | (false, true) => Some(FeedTier::ProbedXml),
        (false, false) => None,
    }
}

/// Same-host URLs, or cross-host URLs that pass [`validate_url`].
fn allowed(site: &Url, url: &Url) -> bool {
    if is_same_host(site, url) {
        return true;
    }
    match validate_url(url.as_str()) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(site = %site, url = %url, error = %e, "Ignoring unsafe feed link");
            false
        }
    }
}

/// Extracts declared feeds and feed-looking anchors from a page.
fn scan_page(html: &str, page_url: &Url) -> (Vec<FeedCandidate>, Vec<FeedCandidate>) {
    let doc = Html::parse_document(html);
    let base = document_base(&doc, page_url);
    (declared_feeds(&doc, &base), anchor_feeds(&doc, &base))
}

/// `<link rel="alternate">` elements whose `type` mentions rss, atom or xml.
pub fn declared_feeds(doc: &Html, base: &Url) -> Vec<FeedCandidate> {
    let Ok(selector) = Selector::parse("link[rel][href]") else {
        return Vec::new();
    };
    doc.select(&selector)
        .filter(|el| {
            let rel = el.value().attr("rel").unwrap_or("").to_ascii_lowercase();
            let kind = el.value().attr("type").unwrap_or("").to_ascii_lowercase();
            rel.split_whitespace().any(|r| r == "alternate")
                && ["rss", "atom", "xml"].iter().any(|k| kind.contains(k))
        })
        .filter_map(|el| {
            let url = resolve_url(el.value().attr("href")?, base)?;
            let title = el
                .value()
                .attr("title")
                .map(clean_text)
                .filter(|t| !t.is_empty());
            Some(FeedCandidate {
                url,
                title,
                tier: FeedTier::Declared,
            })
        })
        .collect()
}

/// In-page anchors whose URL looks like a feed.
pub fn anchor_feeds(doc: &Html, base: &Url) -> Vec<FeedCandidate> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    doc.select(&selector)
        .filter_map(|el| {
            let url = resolve_url(el.value().attr("href")?, base)?;
            let path_and_query = format!("{}{}", url.path(), url.query().unwrap_or(""));
            let lower = path_and_query.to_ascii_lowercase();
            let looks_like_feed =
                FEED_URL_HINTS.iter().any(|h| lower.contains(h)) || lower.ends_with(".rss");
            if !looks_like_feed {
                return None;
            }
            let text = clean_text(&el.text().collect::<String>());
            Some(FeedCandidate {
                url,
                title: (!text.is_empty()).then_some(text),
                tier: FeedTier::Anchor,
            })
        })
        .collect()
}

/// Deduplicates by normalized URL keeping the best tier, drops unsafe
/// cross-host candidates, then stable-sorts best tier first.
fn rank(site: &Url, found: Vec<FeedCandidate>) -> Vec<FeedCandidate> {
    let mut ranked: Vec<FeedCandidate> = Vec::new();

    for candidate in found {
        if !allowed(site, &candidate.url) {
            continue;
        }

        let key = normalize_url(candidate.url.as_str());
        match ranked
            .iter_mut()
            .find(|existing| normalize_url(existing.url.as_str()) == key)
        {
            Some(existing) if candidate.tier > existing.tier => {
                existing.tier = candidate.tier;
                if candidate.title.is_some() {
                    existing.title = candidate.title;
                }
            }
            Some(_) => {}
            None => ranked.push(candidate),
        }
    }

    ranked.sort_by(|a, b| b.tier.cmp(&a.tier));
    ranked
}
