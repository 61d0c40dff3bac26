//! Feedless pages: heuristic selector detection and post extraction.
//!
//! - [`detector`] proposes ranked [`SelectorCandidate`]s for a page
//! - [`extractor`] applies a [`SelectorTriple`](crate::model::SelectorTriple)
//!   to produce posts in document order
//!
//! `scraper::Html` is not `Send`, so both work on an already-parsed document
//! inside synchronous functions and return owned data.

pub mod detector;
pub mod extractor;

pub use detector::{detect, SelectorCandidate, STRATEGIES};
pub use extractor::{extract_posts, ExtractError};

use scraper::{Html, Selector};
use url::Url;

/// Base URL for resolving links in `doc`: `<base href>` if present and
/// resolvable, otherwise the page URL.
pub fn document_base(doc: &Html, page_url: &Url) -> Url {
    let Ok(base) = Selector::parse("base[href]") else {
        return page_url.clone();
    };
    doc.select(&base)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| page_url.join(href.trim()).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or_else(|| page_url.clone())
}
