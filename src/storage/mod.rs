//! Persistence of per-blog monitoring state.
//!
//! The monitor never writes state itself: it reads through [`StateStore::load`]
//! and the run driver saves the proposed state afterwards.

mod schema;
mod states;
mod types;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::model::BlogState;

pub use schema::Database;
pub use types::{DatabaseError, StoreError};

#[async_trait]
pub trait StateStore: Send + Sync {
    /// State for `blog_name`, or `None` if the blog was never checked.
    async fn load(&self, blog_name: &str) -> Result<Option<BlogState>, StoreError>;

    /// Insert or replace the state for `blog_name`.
    async fn save(&self, blog_name: &str, state: &BlogState) -> Result<(), StoreError>;
}

#[async_trait]
impl StateStore for Database {
    async fn load(&self, blog_name: &str) -> Result<Option<BlogState>, StoreError> {
        Ok(self.get_blog_state(blog_name).await?)
    }

    async fn save(&self, blog_name: &str, state: &BlogState) -> Result<(), StoreError> {
        Ok(self.upsert_blog_state(blog_name, state).await?)
    }
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, BlogState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.states.lock().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, blog_name: &str) -> Result<Option<BlogState>, StoreError> {
        Ok(self.states.lock().await.get(blog_name).cloned())
    }

    async fn save(&self, blog_name: &str, state: &BlogState) -> Result<(), StoreError> {
        self.states
            .lock()
            .await
            .insert(blog_name.to_string(), state.clone());
        Ok(())
    }
}
