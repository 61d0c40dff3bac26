use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another blogwatch run holds the database
    #[error("Another blogwatch run appears to be using the state database. Wait for it to finish and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A stored row could not be turned back into a `BlogState`
    #[error("Corrupt state row for '{blog}': {reason}")]
    CorruptRow { blog: String, reason: String },

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface
/// as one of these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

/// Error surfaced by any [`StateStore`](super::StateStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(DatabaseError::from_sqlx(err))
    }
}

// ============================================================================
// Helper Types
// ============================================================================

/// Raw `blog_states` row; timestamps are unix seconds.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BlogStateRow {
    pub blog_name: String,
    pub last_post_url: Option<String>,
    pub last_post_title: Option<String>,
    pub last_post_date: Option<i64>,
    pub last_checked_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub consecutive_failures: i64,
    pub feed_url: Option<String>,
    pub feed_etag: Option<String>,
    pub feed_last_modified: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<String>,
}
