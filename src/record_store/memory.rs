//! In-memory record store implementation.
//!
//! This module provides [`MemoryRecordStore`], a thread-safe in-memory
//! implementation of [`RecordStore`] suitable for testing and development.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RecordFilter, RecordStore, StoredItem};
use crate::Result;

/// An in-memory implementation of [`RecordStore`].
///
/// This implementation uses `Arc<RwLock<...>>` internally, making it
/// safe to clone and share across async tasks. Clones share storage.
#[derive(Debug, Clone)]
pub struct MemoryRecordStore {
    collection: String,
    items: Arc<RwLock<Vec<StoredItem>>>,
}

impl MemoryRecordStore {
    /// Creates a new, empty store for `collection`.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            items: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Returns the number of items currently stored.
    ///
    /// Useful for testing.
    pub async fn item_count(&self) -> usize {
        self.items.read().await.len()
    }

    /// Clears all stored data.
    pub async fn clear(&self) {
        self.items.write().await.clear();
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new("default")
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn delete(&self, filter: &RecordFilter) -> Result<u64> {
        filter.validate()?;
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|item| !filter.matches(&item.data));
        Ok((before - items.len()) as u64)
    }

    async fn create_item(&self, data: JsonValue) -> Result<StoredItem> {
        let item = StoredItem {
            id: Uuid::new_v4().to_string(),
            collection: self.collection.clone(),
            data,
            created_at: Utc::now(),
        };
        self.items.write().await.push(item.clone());
        Ok(item)
    }

    async fn get_item(&self, id: &str) -> Result<Option<StoredItem>> {
        Ok(self
            .items
            .read()
            .await
            .iter()
            .find(|item| item.id == id)
            .cloned())
    }

    async fn list_items(&self, filter: &RecordFilter) -> Result<Vec<StoredItem>> {
        filter.validate()?;
        Ok(self
            .items
            .read()
            .await
            .iter()
            .filter(|item| filter.matches(&item.data))
            .cloned()
            .collect())
    }
}
