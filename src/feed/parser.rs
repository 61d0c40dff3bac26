//! Feed parsing with best-effort recovery.
//!
//! `feed-rs` does the strict parse. When it rejects a document that still
//! looks like a feed, a lenient `quick-xml` pass walks the token stream with
//! end-name checking disabled and salvages every `item`/`entry` it can.

use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, FeedType};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;
use url::Url;

use crate::model::Post;
use crate::util::{clean_text, resolve_url, strip_markup, truncate_to_width};

/// Excerpt width in display columns
pub const EXCERPT_WIDTH: usize = 200;

const UNTITLED: &str = "Untitled";

#[derive(Debug, Error)]
pub enum FeedParseError {
    #[error("Document is not an RSS/Atom feed")]
    NotAFeed,
    #[error("Feed could not be parsed ({found} entries found): {reason}")]
    Unrecoverable { found: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedDialect {
    Rss1,
    Rss2,
    Atom,
    Json,
}

impl FeedDialect {
    fn from_feed_type(feed_type: &FeedType) -> Self {
        match feed_type {
            FeedType::Atom => FeedDialect::Atom,
            FeedType::RSS1 => FeedDialect::Rss1,
            FeedType::JSON => FeedDialect::Json,
            FeedType::RSS0 | FeedType::RSS2 => FeedDialect::Rss2,
        }
    }
}

/// Result of parsing one feed document.
#[derive(Debug)]
pub struct ParsedFeed {
    pub dialect: FeedDialect,
    /// Posts in feed order
    pub posts: Vec<Post>,
    /// Entries dropped because they had no usable link
    pub skipped: usize,
}

/// Parses a feed into posts, in document order.
///
/// Relative entry links resolve against `feed_url`. An empty but well-formed
/// feed is `Ok` with no posts.
///
/// # Errors
///
/// - [`FeedParseError::NotAFeed`] if the bytes are not a feed at all
/// - [`FeedParseError::Unrecoverable`] if the document had entries but none
///   yielded a post, or it is malformed and nothing could be recovered
pub fn parse_feed(
    bytes: &[u8],
    feed_url: &Url,
    blog_name: &str,
) -> Result<ParsedFeed, FeedParseError> {
    let strict_error = match feed_rs::parser::parse(bytes) {
        Ok(feed) => {
            let dialect = FeedDialect::from_feed_type(&feed.feed_type);
            let found = feed.entries.len();
            let posts: Vec<Post> = feed
                .entries
                .into_iter()
                .filter_map(|entry| post_from_entry(entry, feed_url, blog_name))
                .collect();

            if posts.is_empty() && found > 0 {
                return Err(FeedParseError::Unrecoverable {
                    found,
                    reason: "no entry has a usable link".to_string(),
                });
            }
            return Ok(ParsedFeed {
                dialect,
                skipped: found - posts.len(),
                posts,
            });
        }
        Err(e) => e,
    };

    let Some(dialect) = sniff_dialect(bytes) else {
        return Err(FeedParseError::NotAFeed);
    };

    tracing::debug!(feed = %feed_url, error = %strict_error, "Strict feed parse failed, recovering entries");
    let recovered = recover_entries(bytes, feed_url, blog_name);

    // A feed-rooted document the strict parser rejected and that yields no
    // post is broken (truncated, say), never an empty feed
    if recovered.posts.is_empty() {
        return Err(FeedParseError::Unrecoverable {
            found: recovered.found,
            reason: strict_error.to_string(),
        });
    }
    tracing::warn!(
        feed = %feed_url,
        recovered = recovered.posts.len(),
        found = recovered.found,
        "Recovered entries from malformed feed"
    );

    Ok(ParsedFeed {
        dialect,
        skipped: recovered.found - recovered.posts.len(),
        posts: recovered.posts,
    })
}

/// Identifies the feed dialect from the document's root element.
pub fn sniff_dialect(bytes: &[u8]) -> Option<FeedDialect> {
    let mut reader = Reader::from_reader(bytes);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return match e.local_name().as_ref() {
                    b"rss" => Some(FeedDialect::Rss2),
                    b"RDF" => Some(FeedDialect::Rss1),
                    b"feed" => Some(FeedDialect::Atom),
                    _ => None,
                };
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

fn post_from_entry(entry: Entry, feed_url: &Url, blog_name: &str) -> Option<Post> {
    let href = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| entry.links.first())
        .map(|l| l.href.as_str())
        .or_else(|| entry.id.starts_with("http").then_some(entry.id.as_str()))?;
    let url = resolve_url(href, feed_url)?;

    let summary = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body));

    Some(Post {
        title: entry
            .title
            .map(|t| clean_text(&t.content))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNTITLED.to_string()),
        url: url.to_string(),
        published_at: entry.published.or(entry.updated),
        excerpt: summary.as_deref().and_then(make_excerpt),
        source_blog: blog_name.to_string(),
    })
}

fn make_excerpt(raw: &str) -> Option<String> {
    let text = strip_markup(raw);
    if text.is_empty() {
        return None;
    }
    Some(truncate_to_width(&text, EXCERPT_WIDTH).into_owned())
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

// ============================================================================
// Lenient recovery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Id,
    Date,
    Summary,
}

impl Field {
    fn from_tag(local_name: &[u8]) -> Option<Self> {
        match local_name {
            b"title" => Some(Field::Title),
            b"link" => Some(Field::Link),
            b"guid" | b"id" => Some(Field::Id),
            b"pubDate" | b"published" | b"updated" | b"date" => Some(Field::Date),
            b"description" | b"summary" | b"content" | b"encoded" => Some(Field::Summary),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct RawEntry {
    title: Option<String>,
    link: Option<String>,
    id: Option<String>,
    date: Option<String>,
    summary: Option<String>,
}

impl RawEntry {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Title => &mut self.title,
            Field::Link => &mut self.link,
            Field::Id => &mut self.id,
            Field::Date => &mut self.date,
            Field::Summary => &mut self.summary,
        }
    }

    fn into_post(self, feed_url: &Url, blog_name: &str) -> Option<Post> {
        let href = self
            .link
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .or_else(|| self.id.filter(|id| id.trim().starts_with("http")))?;
        let url = resolve_url(&href, feed_url)?;

        Some(Post {
            title: self
                .title
                .map(|t| clean_text(&t))
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| UNTITLED.to_string()),
            url: url.to_string(),
            published_at: self.date.as_deref().and_then(parse_date),
            excerpt: self.summary.as_deref().and_then(make_excerpt),
            source_blog: blog_name.to_string(),
        })
    }
}

struct Recovered {
    posts: Vec<Post>,
    found: usize,
}

fn is_entry_tag(local_name: &[u8]) -> bool {
    matches!(local_name, b"item" | b"entry")
}

fn attr_value(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    let attr = e.try_get_attribute(name).ok().flatten()?;
    attr.unescape_value().ok().map(Cow::into_owned)
}

/// Atom `<link>` elements carry the URL in `href`; only alternate links count.
fn atom_href(e: &BytesStart<'_>) -> Option<String> {
    let rel = attr_value(e, b"rel");
    if rel.as_deref().is_some_and(|r| r != "alternate") {
        return None;
    }
    attr_value(e, b"href")
}

fn recover_entries(bytes: &[u8], feed_url: &Url, blog_name: &str) -> Recovered {
    let mut reader = Reader::from_reader(bytes);
    {
        let config = reader.config_mut();
        config.check_end_names = false;
        config.trim_text(true);
    }

    let mut buf = Vec::new();
    let mut posts = Vec::new();
    let mut found = 0;
    let mut current: Option<RawEntry> = None;
    // Field being filled and the tag that closes it
    let mut open: Option<(Field, Vec<u8>)> = None;

    let finish = |raw: RawEntry, posts: &mut Vec<Post>| {
        if let Some(post) = raw.into_post(feed_url, blog_name) {
            posts.push(post);
        }
    };

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if is_entry_tag(name) {
                    // An unclosed previous entry ends where the next begins
                    if let Some(raw) = current.take() {
                        finish(raw, &mut posts);
                    }
                    found += 1;
                    current = Some(RawEntry::default());
                    open = None;
                } else if let Some(entry) = current.as_mut() {
                    if let Some(field) = Field::from_tag(name) {
                        if field == Field::Link {
                            if let Some(href) = atom_href(&e) {
                                entry.link.get_or_insert(href);
                            }
                        }
                        // Repeated fields (`updated` after `published`): first wins
                        let slot = entry.slot(field);
                        if slot.is_none() {
                            *slot = Some(String::new());
                            open = Some((field, name.to_vec()));
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(entry) = current.as_mut() {
                    if e.local_name().as_ref() == b"link" {
                        if let Some(href) = atom_href(&e) {
                            entry.link.get_or_insert(href);
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(entry), Some((field, _))) = (current.as_mut(), open.as_ref()) {
                    let text = t
                        .unescape()
                        .map(Cow::into_owned)
                        .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                    append(entry.slot(*field), &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(entry), Some((field, _))) = (current.as_mut(), open.as_ref()) {
                    let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                    append(entry.slot(*field), &text);
                }
            }
            Ok(Event::End(e)) => {
                let name = e.local_name();
                let name = name.as_ref();
                if is_entry_tag(name) {
                    if let Some(raw) = current.take() {
                        finish(raw, &mut posts);
                    }
                    open = None;
                } else if open.as_ref().is_some_and(|(_, tag)| tag.as_slice() == name) {
                    open = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(
                    position = reader.buffer_position(),
                    error = %e,
                    "Stopping feed recovery at unreadable markup"
                );
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    if let Some(raw) = current.take() {
        finish(raw, &mut posts);
    }

    Recovered { posts, found }
}

fn append(slot: &mut Option<String>, text: &str) {
    let value = slot.get_or_insert_with(String::new);
    if !value.is_empty() {
        value.push(' ');
    }
    value.push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed_url() -> Url {
        Url::parse("https://blog.example.com/feed.xml").unwrap()
    }

    fn titles(feed: &ParsedFeed) -> Vec<&str> {
        feed.posts.iter().map(|p| p.title.as_str()).collect()
    }

    const RSS2: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Blog</title>
  <item>
    <title>Older post</title>
    <link>/posts/1</link>
    <pubDate>Mon, 01 Jan 2024 10:00:00 +0000</pubDate>
  </item>
  <item>
    <title>  Newer
      post </title>
    <link>https://blog.example.com/posts/2?utm_source=rss</link>
    <description>&lt;p&gt;Hello &amp;amp; welcome&lt;/p&gt;</description>
  </item>
</channel></rss>"#;

    #[test]
    fn test_rss2_keeps_feed_order_and_resolves_links() {
        let feed = parse_feed(RSS2.as_bytes(), &feed_url(), "blog").unwrap();
        assert_eq!(feed.dialect, FeedDialect::Rss2);
        assert_eq!(titles(&feed), vec!["Older post", "Newer post"]);
        assert_eq!(feed.posts[0].url, "https://blog.example.com/posts/1");
        assert!(feed.posts[0].published_at.is_some());
        assert!(feed.posts[1].published_at.is_none());
        assert_eq!(feed.posts[1].excerpt.as_deref(), Some("Hello & welcome"));
        assert_eq!(feed.posts[1].source_blog, "blog");
    }

    #[test]
    fn test_atom_uses_alternate_link() {
        let atom = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Blog</title>
  <id>urn:blog</id>
  <updated>2024-03-01T00:00:00Z</updated>
  <entry>
    <title>Atom post</title>
    <id>urn:post:1</id>
    <link rel="edit" href="https://blog.example.com/edit/1"/>
    <link rel="alternate" href="https://blog.example.com/a/1"/>
    <updated>2024-03-01T00:00:00Z</updated>
    <summary>Short summary</summary>
  </entry>
</feed>"#;
        let feed = parse_feed(atom.as_bytes(), &feed_url(), "blog").unwrap();
        assert_eq!(feed.dialect, FeedDialect::Atom);
        assert_eq!(feed.posts.len(), 1);
        assert_eq!(feed.posts[0].url, "https://blog.example.com/a/1");
        assert_eq!(feed.posts[0].excerpt.as_deref(), Some("Short summary"));
    }

    #[test]
    fn test_rss1_dialect() {
        let rdf = r#"<?xml version="1.0"?>
<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#" xmlns="http://purl.org/rss/1.0/">
  <channel rdf:about="https://blog.example.com/">
    <title>Blog</title>
    <link>https://blog.example.com/</link>
    <description>d</description>
  </channel>
  <item rdf:about="https://blog.example.com/r/1">
    <title>RDF post</title>
    <link>https://blog.example.com/r/1</link>
  </item>
</rdf:RDF>"#;
        assert_eq!(sniff_dialect(rdf.as_bytes()), Some(FeedDialect::Rss1));
        let feed = parse_feed(rdf.as_bytes(), &feed_url(), "blog").unwrap();
        assert_eq!(titles(&feed), vec!["RDF post"]);
    }

    #[test]
    fn test_empty_feed_is_ok() {
        let empty = r#"<rss version="2.0"><channel><title>Quiet</title></channel></rss>"#;
        let feed = parse_feed(empty.as_bytes(), &feed_url(), "blog").unwrap();
        assert!(feed.posts.is_empty());
    }

    #[test]
    fn test_html_and_garbage_are_not_feeds() {
        let html = "<!DOCTYPE html><html><head><title>Hi</title></head><body></body></html>";
        assert!(matches!(
            parse_feed(html.as_bytes(), &feed_url(), "blog"),
            Err(FeedParseError::NotAFeed)
        ));
        assert!(matches!(
            parse_feed(b"just some words", &feed_url(), "blog"),
            Err(FeedParseError::NotAFeed)
        ));
    }

    #[test]
    fn test_malformed_feed_recovers_entries() {
        let broken = r#"<rss version="2.0"><channel><title>Blog</title>
<item><title>One</title><link>https://blog.example.com/1</link></item>
<item><title>Broken</titel><link>https://blog.example.com/2</link></item>
<item><title>Three</title><link>https://blog.example.com/3</link>
  <pubDate>2024-02-01T08:00:00Z</pubDate></item>
</channel></rss>"#;
        let feed = parse_feed(broken.as_bytes(), &feed_url(), "blog").unwrap();
        assert_eq!(titles(&feed), vec!["One", "Broken", "Three"]);
        assert_eq!(feed.posts[1].url, "https://blog.example.com/2");
        assert!(feed.posts[2].published_at.is_some());
    }

    #[test]
    fn test_entries_without_links_are_unrecoverable() {
        let linkless = r#"<rss version="2.0"><channel><title>Blog</title>
<item><title>No link</title></item>
<item><title>Still none</title></item>
</channel></rss>"#;
        assert!(matches!(
            parse_feed(linkless.as_bytes(), &feed_url(), "blog"),
            Err(FeedParseError::Unrecoverable { found: 2, .. })
        ));
    }

    #[test]
    fn test_truncated_feed_is_unrecoverable() {
        let truncated = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Blog</tit"#;
        assert!(matches!(
            parse_feed(truncated.as_bytes(), &feed_url(), "blog"),
            Err(FeedParseError::Unrecoverable { found: 0, .. })
        ));
    }

    #[test]
    fn test_long_excerpt_truncated() {
        let body = "word ".repeat(100);
        let rss = format!(
            r#"<rss version="2.0"><channel><title>B</title><item><title>T</title><link>https://blog.example.com/t</link><description>{body}</description></item></channel></rss>"#
        );
        let feed = parse_feed(rss.as_bytes(), &feed_url(), "blog").unwrap();
        let excerpt = feed.posts[0].excerpt.as_deref().unwrap();
        assert!(excerpt.ends_with("..."));
        assert!(excerpt.len() <= EXCERPT_WIDTH);
    }
}
