//! Structured feeds: finding them and turning them into posts.
//!
//! - [`discovery`] - ranked feed URL discovery for a site (declared links,
//!   probed conventional paths, feed-looking anchors)
//! - [`parser`] - RSS 1.0 / RSS 2.0 / Atom parsing with malformed-XML recovery
//! - [`health`] - one-off diagnosis of a feed URL

pub mod discovery;
pub mod health;
pub mod parser;

pub use discovery::{discover_feeds, FeedCandidate, FeedTier};
pub use health::{check_feed_health, FeedHealth};
pub use parser::{parse_feed, FeedDialect, FeedParseError, ParsedFeed};
