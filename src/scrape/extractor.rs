use chrono::{DateTime, NaiveDate, Utc};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use thiserror::Error;
use url::Url;

use super::document_base;
use crate::feed::parser::EXCERPT_WIDTH;
use crate::model::{Post, SelectorTriple, SELF_SELECTOR};
use crate::util::{clean_text, resolve_url, truncate_to_width};

/// Every variant means the selectors no longer fit the page.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Invalid CSS selector `{0}`")]
    InvalidSelector(String),
    #[error("Container selector `{0}` matched nothing")]
    NoContainers(String),
    #[error("Container selector `{selector}` matched {count} elements but none had a title")]
    NoTitles { selector: String, count: usize },
    #[error("All {count} extracted posts share one identity: {identity}")]
    Degenerate { count: usize, identity: String },
}

/// A [`SelectorTriple`] with its selectors parsed. `None` title/link means
/// the container element itself.
pub(crate) struct CompiledTriple {
    pub(crate) container: Selector,
    title: Option<Selector>,
    link: Option<Selector>,
}

fn compile_one(selector: &str) -> Result<Option<Selector>, ExtractError> {
    if selector.trim() == SELF_SELECTOR {
        return Ok(None);
    }
    Selector::parse(selector)
        .map(Some)
        .map_err(|_| ExtractError::InvalidSelector(selector.to_string()))
}

impl CompiledTriple {
    pub(crate) fn compile(triple: &SelectorTriple) -> Result<Self, ExtractError> {
        let container = Selector::parse(&triple.container)
            .map_err(|_| ExtractError::InvalidSelector(triple.container.clone()))?;
        Ok(Self {
            container,
            title: compile_one(&triple.title)?,
            link: compile_one(&triple.link)?,
        })
    }

    /// Cleaned title text of one container; empty when nothing matches.
    pub(crate) fn title_text(&self, el: ElementRef<'_>) -> String {
        match &self.title {
            None => text_of(el),
            Some(sel) => el
                .select(sel)
                .map(text_of)
                .find(|t| !t.is_empty())
                .or_else(|| sel.matches(&el).then(|| text_of(el)))
                .unwrap_or_default(),
        }
    }

    /// Raw `href` of one container's link.
    pub(crate) fn href<'a>(&self, el: ElementRef<'a>) -> Option<&'a str> {
        match &self.link {
            None => el.value().attr("href"),
            Some(sel) => el
                .select(sel)
                .find_map(|a| a.value().attr("href"))
                .or_else(|| sel.matches(&el).then(|| el.value().attr("href")).flatten()),
        }
    }
}

pub(crate) fn text_of(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<String>())
}

/// Applies `triple` to a parsed page, returning posts in document order.
///
/// Links resolve against `<base href>` when present, otherwise `page_url`; a
/// container without a link gets the page URL. Containers without a title
/// are skipped.
pub fn extract_posts(
    doc: &Html,
    page_url: &Url,
    triple: &SelectorTriple,
    blog_name: &str,
) -> Result<Vec<Post>, ExtractError> {
    let compiled = CompiledTriple::compile(triple)?;
    let base = document_base(doc, page_url);

    let containers: Vec<ElementRef<'_>> = doc.select(&compiled.container).collect();
    if containers.is_empty() {
        return Err(ExtractError::NoContainers(triple.container.clone()));
    }

    let count = containers.len();
    let posts: Vec<Post> = containers
        .into_iter()
        .filter_map(|el| {
            let title = compiled.title_text(el);
            if title.is_empty() {
                return None;
            }
            let url = compiled
                .href(el)
                .and_then(|href| resolve_url(href, &base))
                .unwrap_or_else(|| page_url.clone());
            Some(Post {
                title,
                url: url.to_string(),
                published_at: date_of(el),
                excerpt: excerpt_of(el),
                source_blog: blog_name.to_string(),
            })
        })
        .collect();

    if posts.is_empty() {
        return Err(ExtractError::NoTitles {
            selector: triple.container.clone(),
            count,
        });
    }

    if posts.len() > 1 {
        let identities: HashSet<_> = posts.iter().map(Post::identity).collect();
        if identities.len() == 1 {
            return Err(ExtractError::Degenerate {
                count: posts.len(),
                identity: posts[0].identity().to_string(),
            });
        }
    }

    Ok(posts)
}

fn excerpt_of(el: ElementRef<'_>) -> Option<String> {
    let sel = Selector::parse("p").ok()?;
    let text = el.select(&sel).map(text_of).find(|t| !t.is_empty())?;
    Some(truncate_to_width(&text, EXCERPT_WIDTH).into_owned())
}

fn date_of(el: ElementRef<'_>) -> Option<DateTime<Utc>> {
    let sel = Selector::parse("time[datetime]").ok()?;
    let raw = el.select(&sel).next()?.value().attr("datetime")?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn page() -> Url {
        Url::parse("https://blog.example.com/").unwrap()
    }

    fn triple(container: &str, title: &str, link: &str) -> SelectorTriple {
        SelectorTriple::new(container, title, link)
    }

    const THREE_POSTS: &str = r#"<html><body><main>
        <article class="post"><h2><a href="/p/3">C</a></h2><time datetime="2024-03-03">Mar 3</time><p>Third post body</p></article>
        <article class="post"><h2><a href="/p/2">B</a></h2></article>
        <article class="post"><h2><a href="/p/1">A</a></h2></article>
    </main></body></html>"#;

    #[test]
    fn test_extracts_in_document_order() {
        let doc = Html::parse_document(THREE_POSTS);
        let posts =
            extract_posts(&doc, &page(), &triple("article.post", "h2", "h2 a[href]"), "b").unwrap();

        let summary: Vec<(&str, &str)> =
            posts.iter().map(|p| (p.title.as_str(), p.url.as_str())).collect();
        assert_eq!(
            summary,
            vec![
                ("C", "https://blog.example.com/p/3"),
                ("B", "https://blog.example.com/p/2"),
                ("A", "https://blog.example.com/p/1"),
            ]
        );
        assert_eq!(posts[0].excerpt.as_deref(), Some("Third post body"));
        assert!(posts[0].published_at.is_some());
        assert!(posts[1].published_at.is_none());
    }

    #[test]
    fn test_self_selectors_on_anchor_containers() {
        let doc = Html::parse_document(
            r#"<ul>
              <li><a class="post-link" href="posts/two.html"> “Second” </a></li>
              <li><a class="post-link" href="posts/one.html">First</a></li>
            </ul>"#,
        );
        let url = Url::parse("https://example.com/blog/").unwrap();
        let posts = extract_posts(&doc, &url, &triple("a.post-link", "self", "self"), "b").unwrap();
        assert_eq!(posts[0].title, "Second");
        assert_eq!(posts[0].url, "https://example.com/blog/posts/two.html");
    }

    #[test]
    fn test_base_href_used_for_resolution() {
        let doc = Html::parse_document(
            r#"<head><base href="https://cdn.example.com/archive/"></head>
               <body><div class="entry"><h3><a href="x">X</a></h3></div>
               <div class="entry"><h3><a href="y">Y</a></h3></div></body>"#,
        );
        let posts = extract_posts(&doc, &page(), &triple("div.entry", "h3", "a[href]"), "b").unwrap();
        assert_eq!(posts[1].url, "https://cdn.example.com/archive/y");
    }

    #[test]
    fn test_missing_link_falls_back_to_page_url() {
        let doc = Html::parse_document(r#"<div class="entry"><h2>Only a title</h2></div>"#);
        let posts = extract_posts(&doc, &page(), &triple("div.entry", "h2", "a[href]"), "b").unwrap();
        assert_eq!(posts[0].url, page().to_string());
    }

    #[test]
    fn test_no_containers_is_selector_break() {
        let doc = Html::parse_document(THREE_POSTS);
        let err = extract_posts(&doc, &page(), &triple("div.gone", "h2", "a[href]"), "b").unwrap_err();
        assert!(matches!(err, ExtractError::NoContainers(_)));
    }

    #[test]
    fn test_duplicate_identities_are_degenerate() {
        let doc = Html::parse_document(
            r#"<div class="card"><a href="/more">Read more</a></div>
               <div class="card"><a href="/more">Read more</a></div>"#,
        );
        let err = extract_posts(&doc, &page(), &triple("div.card", "a[href]", "a[href]"), "b")
            .unwrap_err();
        assert!(matches!(err, ExtractError::Degenerate { count: 2, .. }));
    }

    #[test]
    fn test_invalid_selector_rejected() {
        let doc = Html::parse_document(THREE_POSTS);
        let err = extract_posts(&doc, &page(), &triple("article..post", "h2", "a"), "b").unwrap_err();
        assert!(matches!(err, ExtractError::InvalidSelector(_)));
    }

    #[test]
    fn test_title_falls_back_to_container_matching_title_selector() {
        let doc = Html::parse_document(
            r#"<h2 class="post-title"><a href="/a">Alpha</a></h2>
               <h2 class="post-title"><a href="/b">Beta</a></h2>"#,
        );
        let posts = extract_posts(&doc, &page(), &triple("h2.post-title", "h2", "a[href]"), "b").unwrap();
        assert_eq!(posts[0].title, "Alpha");
        assert_eq!(posts[1].url, "https://blog.example.com/b");
    }
}
