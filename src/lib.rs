//! Watches a list of blogs for new posts.
//!
//! Each blog is checked through its feed when one can be found (cached
//! feed URL, declared `<link rel="alternate">`, anchors, probed paths) and
//! otherwise by scraping the page with detected or configured CSS selectors.
//! A run compares what it finds with the last post stored for the blog and
//! reports only what is new.

pub mod config;
pub mod feed;
pub mod fetch;
pub mod model;
pub mod monitor;
pub mod scrape;
pub mod storage;
pub mod util;
