use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{Post, PostIdentity};

/// How the fresh extraction relates to the stored last post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// No prior identity; this run only records the newest post
    Baseline,
    Unchanged,
    NewPosts,
    /// Stored identity is gone from the extraction; newest post reported
    Ambiguous,
    /// Nothing was extracted; prior identity kept
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeReport {
    /// Newest first
    pub new_posts: Vec<Post>,
    /// Identity to store after this run
    pub latest: Option<PostIdentity>,
    pub latest_date: Option<DateTime<Utc>>,
    pub status: ChangeStatus,
}

/// Orders posts newest-first.
///
/// Dates are trusted only when every post has one and the sequence is
/// monotonic; an ascending sequence is reversed. Anything else keeps source
/// order, which is assumed to already be newest-first.
pub fn order_newest_first(mut posts: Vec<Post>) -> Vec<Post> {
    let dates: Option<Vec<DateTime<Utc>>> = posts.iter().map(|p| p.published_at).collect();
    if let Some(dates) = dates {
        let ascending = dates.windows(2).all(|w| w[0] <= w[1]);
        let descending = dates.windows(2).all(|w| w[0] >= w[1]);
        if ascending && !descending {
            posts.reverse();
        }
    }
    posts
}

/// Compares a fresh extraction with the stored last-post identity.
///
/// Pure: the same inputs always give the same report.
pub fn detect_changes(posts: Vec<Post>, prior: Option<&PostIdentity>) -> ChangeReport {
    let ordered = order_newest_first(posts);

    let Some(newest) = ordered.first() else {
        return ChangeReport {
            new_posts: Vec::new(),
            latest: prior.cloned(),
            latest_date: None,
            status: ChangeStatus::Empty,
        };
    };
    let latest = Some(newest.identity());
    let latest_date = newest.published_at;

    let Some(prior) = prior else {
        return ChangeReport {
            new_posts: Vec::new(),
            latest,
            latest_date,
            status: ChangeStatus::Baseline,
        };
    };

    match ordered.iter().position(|p| &p.identity() == prior) {
        Some(0) => ChangeReport {
            new_posts: Vec::new(),
            latest,
            latest_date,
            status: ChangeStatus::Unchanged,
        },
        Some(idx) => {
            let mut ordered = ordered;
            ordered.truncate(idx);
            ChangeReport {
                new_posts: ordered,
                latest,
                latest_date,
                status: ChangeStatus::NewPosts,
            }
        }
        None => {
            let newest = ordered.into_iter().next();
            ChangeReport {
                new_posts: newest.into_iter().collect(),
                latest,
                latest_date,
                status: ChangeStatus::Ambiguous,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn post(path: &str, title: &str) -> Post {
        Post {
            title: title.to_string(),
            url: format!("https://blog.example.com{path}"),
            published_at: None,
            excerpt: None,
            source_blog: "blog".to_string(),
        }
    }

    fn dated(path: &str, title: &str, day: u32) -> Post {
        Post {
            published_at: Some(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
            ..post(path, title)
        }
    }

    fn titles(posts: &[Post]) -> Vec<&str> {
        posts.iter().map(|p| p.title.as_str()).collect()
    }

    fn cba() -> Vec<Post> {
        vec![post("/p/3", "C"), post("/p/2", "B"), post("/p/1", "A")]
    }

    #[test]
    fn test_first_run_is_baseline() {
        let report = detect_changes(cba(), None);
        assert!(report.new_posts.is_empty());
        assert_eq!(report.status, ChangeStatus::Baseline);
        assert_eq!(
            report.latest,
            Some(PostIdentity::new("https://blog.example.com/p/3", "C"))
        );
    }

    #[test]
    fn test_new_posts_stop_at_stored_identity() {
        let mut posts = vec![post("/p/4", "D")];
        posts.extend(cba());
        let prior = PostIdentity::new("https://blog.example.com/p/2", "B");

        let report = detect_changes(posts, Some(&prior));
        assert_eq!(titles(&report.new_posts), vec!["D", "C"]);
        assert_eq!(report.status, ChangeStatus::NewPosts);
        assert_eq!(report.latest.unwrap().title, "D");
    }

    #[test]
    fn test_unchanged_when_newest_matches() {
        let prior = PostIdentity::new("https://blog.example.com/p/3/", "C");
        let report = detect_changes(cba(), Some(&prior));
        assert!(report.new_posts.is_empty());
        assert_eq!(report.status, ChangeStatus::Unchanged);
    }

    #[test]
    fn test_missing_prior_reports_only_newest() {
        let prior = PostIdentity::new("https://blog.example.com/p/0", "Purged");
        let report = detect_changes(cba(), Some(&prior));
        assert_eq!(titles(&report.new_posts), vec!["C"]);
        assert_eq!(report.status, ChangeStatus::Ambiguous);
        assert_eq!(report.latest.unwrap().title, "C");
    }

    #[test]
    fn test_empty_extraction_keeps_prior() {
        let prior = PostIdentity::new("https://blog.example.com/p/3", "C");
        let report = detect_changes(Vec::new(), Some(&prior));
        assert!(report.new_posts.is_empty());
        assert_eq!(report.latest, Some(prior));
        assert_eq!(report.status, ChangeStatus::Empty);
    }

    #[test]
    fn test_ascending_dates_are_reversed() {
        let posts = vec![dated("/p/1", "A", 1), dated("/p/2", "B", 2), dated("/p/3", "C", 3)];
        assert_eq!(titles(&order_newest_first(posts)), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_unsorted_or_partial_dates_keep_source_order() {
        let shuffled = vec![dated("/p/2", "B", 2), dated("/p/3", "C", 3), dated("/p/1", "A", 1)];
        assert_eq!(titles(&order_newest_first(shuffled)), vec!["B", "C", "A"]);

        let partial = vec![dated("/p/1", "A", 1), post("/p/3", "C")];
        assert_eq!(titles(&order_newest_first(partial)), vec!["A", "C"]);
    }

    fn arb_posts() -> impl Strategy<Value = Vec<Post>> {
        prop::collection::vec((0u32..20, "[a-z]{1,6}"), 0..12).prop_map(|items| {
            items
                .into_iter()
                .map(|(n, title)| post(&format!("/p/{n}"), &title))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_detection_is_idempotent(posts in arb_posts(), pick in 0usize..16) {
            let prior = posts.get(pick).map(Post::identity);
            let first = detect_changes(posts.clone(), prior.as_ref());
            let second = detect_changes(posts, prior.as_ref());
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_baseline_never_reports_posts(posts in arb_posts()) {
            prop_assert!(detect_changes(posts, None).new_posts.is_empty());
        }

        #[test]
        fn prop_latest_is_head_or_prior(posts in arb_posts(), pick in 0usize..16) {
            let prior = posts.get(pick).map(Post::identity);
            let head = order_newest_first(posts.clone()).first().map(Post::identity);
            let report = detect_changes(posts, prior.as_ref());
            if head.is_some() {
                prop_assert_eq!(report.latest, head);
            } else {
                prop_assert_eq!(report.latest, prior);
            }
        }
    }
}
