use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{BlogStateRow, DatabaseError};
use crate::model::{BlogState, ErrorKind, PostIdentity};

const SELECT_STATE: &str = r#"
    SELECT blog_name, last_post_url, last_post_title, last_post_date,
           last_checked_at, last_success_at, consecutive_failures,
           feed_url, feed_etag, feed_last_modified, last_error, last_error_kind
    FROM blog_states
"#;

fn to_secs(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp())
}

fn from_secs(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

impl BlogStateRow {
    fn into_state(self) -> Result<BlogState, DatabaseError> {
        let last_error_kind = self
            .last_error_kind
            .as_deref()
            .map(str::parse::<ErrorKind>)
            .transpose()
            .map_err(|reason| DatabaseError::CorruptRow {
                blog: self.blog_name.clone(),
                reason,
            })?;

        // Identity is stored already normalized; rebuild it without re-normalizing.
        let last_post = match (self.last_post_url, self.last_post_title) {
            (Some(url), Some(title)) => Some(PostIdentity { url, title }),
            _ => None,
        };

        Ok(BlogState {
            blog_name: self.blog_name,
            last_post,
            last_post_date: from_secs(self.last_post_date),
            last_checked_at: from_secs(self.last_checked_at),
            last_success_at: from_secs(self.last_success_at),
            consecutive_failures: u32::try_from(self.consecutive_failures).unwrap_or(0),
            feed_url: self.feed_url,
            feed_etag: self.feed_etag,
            feed_last_modified: from_secs(self.feed_last_modified),
            last_error: self.last_error,
            last_error_kind,
        })
    }
}

impl Database {
    // ========================================================================
    // Blog State Operations
    // ========================================================================

    /// Load the persisted state for one blog
    pub async fn get_blog_state(&self, blog_name: &str) -> Result<Option<BlogState>, DatabaseError> {
        let row: Option<BlogStateRow> =
            sqlx::query_as(&format!("{SELECT_STATE} WHERE blog_name = ?"))
                .bind(blog_name)
                .fetch_optional(&self.pool)
                .await
                .map_err(DatabaseError::from_sqlx)?;

        row.map(BlogStateRow::into_state).transpose()
    }

    /// All stored states, ordered by blog name
    pub async fn list_blog_states(&self) -> Result<Vec<BlogState>, DatabaseError> {
        let rows: Vec<BlogStateRow> = sqlx::query_as(&format!("{SELECT_STATE} ORDER BY blog_name"))
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        rows.into_iter().map(BlogStateRow::into_state).collect()
    }

    /// Insert or replace a blog's state
    pub async fn upsert_blog_state(
        &self,
        blog_name: &str,
        state: &BlogState,
    ) -> Result<(), DatabaseError> {
        let (post_url, post_title) = match &state.last_post {
            Some(identity) => (Some(identity.url.as_str()), Some(identity.title.as_str())),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO blog_states (
                blog_name, last_post_url, last_post_title, last_post_date,
                last_checked_at, last_success_at, consecutive_failures,
                feed_url, feed_etag, feed_last_modified, last_error, last_error_kind
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(blog_name) DO UPDATE SET
                last_post_url = excluded.last_post_url,
                last_post_title = excluded.last_post_title,
                last_post_date = excluded.last_post_date,
                last_checked_at = excluded.last_checked_at,
                last_success_at = excluded.last_success_at,
                consecutive_failures = excluded.consecutive_failures,
                feed_url = excluded.feed_url,
                feed_etag = excluded.feed_etag,
                feed_last_modified = excluded.feed_last_modified,
                last_error = excluded.last_error,
                last_error_kind = excluded.last_error_kind
            "#,
        )
        .bind(blog_name)
        .bind(post_url)
        .bind(post_title)
        .bind(to_secs(state.last_post_date))
        .bind(to_secs(state.last_checked_at))
        .bind(to_secs(state.last_success_at))
        .bind(i64::from(state.consecutive_failures))
        .bind(&state.feed_url)
        .bind(&state.feed_etag)
        .bind(to_secs(state.feed_last_modified))
        .bind(&state.last_error)
        .bind(state.last_error_kind.map(|k| k.as_str()))
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(())
    }

    /// Delete the states of blogs that are no longer configured.
    ///
    /// Returns the number of rows removed. An empty `keep` list clears the table.
    pub async fn retain_blogs(&self, keep: &[String]) -> Result<u64, DatabaseError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("DELETE FROM blog_states");
        if !keep.is_empty() {
            builder.push(" WHERE blog_name NOT IN (");
            let mut separated = builder.separated(", ");
            for name in keep {
                separated.push_bind(name);
            }
            separated.push_unseparated(")");
        }

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() > 0 {
            tracing::info!(removed = result.rows_affected(), "Pruned states of removed blogs");
        }
        Ok(result.rows_affected())
    }
}
