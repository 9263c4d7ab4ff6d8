//! Persistent storage for extracted records.
//!
//! This module provides the [`RecordStore`] trait, a small JSON document
//! store scoped to one collection, along with concrete implementations:
//!
//! - [`MemoryRecordStore`]: Thread-safe in-memory storage for testing/development
//! - `SqliteRecordStore`: SQLite-backed storage (requires the `sqlite` feature)
//!
//! # Example
//!
//! ```
//! use heddle::{MemoryRecordStore, RecordFilter, RecordStore};
//! use serde_json::json;
//!
//! # async fn example() -> heddle::Result<()> {
//! let store = MemoryRecordStore::new("invoices");
//!
//! store.create_item(json!({"file_hash": "abc", "status": "reconciled"})).await?;
//! let removed = store.delete(&RecordFilter::eq("file_hash", "abc")).await?;
//! assert_eq!(removed, 1);
//! # Ok(())
//! # }
//! ```

mod memory;

#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryRecordStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRecordStore;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{HeddleError, Result};

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    /// Store-assigned identifier.
    pub id: String,
    /// Collection the item belongs to.
    pub collection: String,
    /// The document.
    pub data: JsonValue,
    /// When the item was created.
    pub created_at: DateTime<Utc>,
}

/// Field-equality filter; all conditions must hold.
///
/// Fields are dotted paths into the document, e.g. `file_hash` or
/// `data.vendor_name`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    conditions: Vec<(String, JsonValue)>,
}

impl RecordFilter {
    /// Matches documents whose `field` equals `value`.
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::default().and_eq(field, value)
    }

    /// Adds another equality condition.
    pub fn and_eq(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    /// The `(field, value)` conditions.
    pub fn conditions(&self) -> &[(String, JsonValue)] {
        &self.conditions
    }

    /// Returns true if there are no conditions (matches everything).
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluates the filter against a document.
    pub fn matches(&self, document: &JsonValue) -> bool {
        self.conditions
            .iter()
            .all(|(field, expected)| lookup(document, field) == Some(expected))
    }

    /// Rejects field paths that are empty or contain characters outside
    /// `[A-Za-z0-9_.]`.
    pub(crate) fn validate(&self) -> Result<()> {
        for (field, _) in &self.conditions {
            let valid = !field.is_empty()
                && field.split('.').all(|segment| {
                    !segment.is_empty()
                        && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                });
            if !valid {
                return Err(HeddleError::RecordStore(format!(
                    "invalid filter field: {field:?}"
                )));
            }
        }
        Ok(())
    }
}

fn lookup<'a>(document: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    path.split('.')
        .try_fold(document, |value, segment| value.get(segment))
}

/// A trait for persisting extracted records.
///
/// # Object Safety
///
/// This trait is object-safe, allowing for dynamic dispatch with
/// `dyn RecordStore`, so storage backends can be swapped at runtime.
#[async_trait]
pub trait RecordStore: Debug + Send + Sync {
    /// The collection this store writes to.
    fn collection(&self) -> &str;

    /// Deletes every item matching `filter`, returning how many were
    /// removed.
    async fn delete(&self, filter: &RecordFilter) -> Result<u64>;

    /// Stores a new item and returns it with its assigned id.
    async fn create_item(&self, data: JsonValue) -> Result<StoredItem>;

    /// Fetches one item by id.
    async fn get_item(&self, id: &str) -> Result<Option<StoredItem>>;

    /// Lists items matching `filter` in creation order.
    async fn list_items(&self, filter: &RecordFilter) -> Result<Vec<StoredItem>>;
}
