//! SQLite-backed record store implementation.
//!
//! This module provides [`SqliteRecordStore`], a persistent implementation
//! of [`RecordStore`] backed by SQLite. Documents are stored as JSON text
//! and filtered with SQLite's JSON functions.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{RecordFilter, RecordStore, StoredItem};
use crate::{HeddleError, Result};

/// Schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// SQL for creating the records table.
const CREATE_RECORDS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        collection TEXT NOT NULL,
        data_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
"#;

/// SQL for creating the schema_version table.
const CREATE_SCHEMA_VERSION_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    )
"#;

/// Index on records for querying by collection.
const CREATE_COLLECTION_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_records_collection
    ON records (collection)
"#;

/// A SQLite-backed implementation of [`RecordStore`].
///
/// # Thread Safety
///
/// The store wraps the SQLite connection in a `Mutex` and uses
/// `spawn_blocking` for all database operations, making it safe
/// for use in async contexts.
///
/// # Example
///
/// ```rust,ignore
/// use heddle::SqliteRecordStore;
///
/// let store = SqliteRecordStore::open("records.db", "invoices").await?;
/// ```
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    collection: String,
}

fn db_error(context: &str, e: impl std::fmt::Display) -> HeddleError {
    HeddleError::Database(format!("{context}: {e}"))
}

impl SqliteRecordStore {
    /// Opens a SQLite database at the given path.
    ///
    /// Creates the database and schema if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the
    /// schema cannot be created.
    pub async fn open(path: impl AsRef<Path>, collection: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let conn = tokio::task::spawn_blocking(move || Connection::open(&path))
            .await
            .map_err(|e| db_error("spawn_blocking failed", e))?
            .map_err(|e| db_error("failed to open database", e))?;

        Self::with_connection(conn, collection.into()).await
    }

    /// Opens an in-memory SQLite database.
    ///
    /// Useful for testing. The database is lost when the store is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub async fn open_in_memory(collection: impl Into<String>) -> Result<Self> {
        let conn = tokio::task::spawn_blocking(Connection::open_in_memory)
            .await
            .map_err(|e| db_error("spawn_blocking failed", e))?
            .map_err(|e| db_error("failed to open in-memory database", e))?;

        Self::with_connection(conn, collection.into()).await
    }

    async fn with_connection(conn: Connection, collection: String) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            collection,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Runs schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();

            conn.execute(CREATE_SCHEMA_VERSION_TABLE, [])?;

            let version: Option<i32> = conn
                .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                    row.get(0)
                })
                .ok();

            if version.map_or(true, |v| v < SCHEMA_VERSION) {
                conn.execute(CREATE_RECORDS_TABLE, [])?;
                conn.execute(CREATE_COLLECTION_INDEX, [])?;

                conn.execute("DELETE FROM schema_version", [])?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }

            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(|e| db_error("spawn_blocking failed", e))?
        .map_err(|e| db_error("migration failed", e))
    }

    /// Builds `collection = ?1 AND json_extract(data_json, ?2) = json_extract(?3, '$') ...`
    /// and its parameters.
    fn where_clause(&self, filter: &RecordFilter) -> Result<(String, Vec<String>)> {
        filter.validate()?;

        let mut clause = String::from("collection = ?1");
        let mut values = vec![self.collection.clone()];

        for (field, expected) in filter.conditions() {
            let path_param = values.len() + 1;
            let value_param = values.len() + 2;
            clause.push_str(&format!(
                " AND json_extract(data_json, ?{path_param}) = json_extract(?{value_param}, '$')"
            ));
            values.push(format!("$.{field}"));
            values.push(serde_json::to_string(expected)?);
        }

        Ok((clause, values))
    }
}

// Debug implementation that doesn't expose connection details
impl std::fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRecordStore")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

type Row = (String, String, String, String);

fn row_to_item(row: Row) -> Result<StoredItem> {
    let (id, collection, data_json, created_at) = row;
    Ok(StoredItem {
        id,
        collection,
        data: serde_json::from_str(&data_json)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| db_error("invalid created_at", e))?
            .with_timezone(&Utc),
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn delete(&self, filter: &RecordFilter) -> Result<u64> {
        let (clause, values) = self.where_clause(filter)?;
        let conn = Arc::clone(&self.conn);

        let removed = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                &format!("DELETE FROM records WHERE {clause}"),
                params_from_iter(values.iter()),
            )
        })
        .await
        .map_err(|e| db_error("spawn_blocking failed", e))?
        .map_err(|e| db_error("delete failed", e))?;

        Ok(removed as u64)
    }

    async fn create_item(&self, data: JsonValue) -> Result<StoredItem> {
        let item = StoredItem {
            id: Uuid::new_v4().to_string(),
            collection: self.collection.clone(),
            data,
            created_at: Utc::now(),
        };
        let conn = Arc::clone(&self.conn);
        let id = item.id.clone();
        let collection = item.collection.clone();
        let data_json = serde_json::to_string(&item.data)?;
        let created_at = item.created_at.to_rfc3339();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO records (id, collection, data_json, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, collection, data_json, created_at],
            )
        })
        .await
        .map_err(|e| db_error("spawn_blocking failed", e))?
        .map_err(|e| db_error("insert failed", e))?;

        Ok(item)
    }

    async fn get_item(&self, id: &str) -> Result<Option<StoredItem>> {
        let conn = Arc::clone(&self.conn);
        let id = id.to_string();
        let collection = self.collection.clone();

        let row = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let result = conn.query_row(
                "SELECT id, collection, data_json, created_at FROM records WHERE id = ?1 AND collection = ?2",
                params![id, collection],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            );

            match result {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| db_error("spawn_blocking failed", e))?
        .map_err(|e| db_error("query failed", e))?;

        row.map(row_to_item).transpose()
    }

    async fn list_items(&self, filter: &RecordFilter) -> Result<Vec<StoredItem>> {
        let (clause, values) = self.where_clause(filter)?;
        let conn = Arc::clone(&self.conn);

        let rows: Vec<Row> = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT id, collection, data_json, created_at FROM records WHERE {clause} ORDER BY seq"
            ))?;
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<Row>>>()
        })
        .await
        .map_err(|e| db_error("spawn_blocking failed", e))?
        .map_err(|e| db_error("query failed", e))?;

        rows.into_iter().map(row_to_item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_in_memory_runs_migrations() {
        let store = SqliteRecordStore::open_in_memory("invoices").await.unwrap();
        assert_eq!(store.collection(), "invoices");
        assert!(store.list_items(&RecordFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_item() {
        let store = SqliteRecordStore::open_in_memory("invoices").await.unwrap();
        let created = store
            .create_item(json!({"file_hash": "h1", "data": {"total": 10}}))
            .await
            .unwrap();

        let fetched = store.get_item(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.data, created.data);
        assert_eq!(fetched.collection, "invoices");
        assert!(store.get_item("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_matches_json_fields() {
        let store = SqliteRecordStore::open_in_memory("invoices").await.unwrap();
        store.create_item(json!({"file_hash": "h1"})).await.unwrap();
        store.create_item(json!({"file_hash": "h1"})).await.unwrap();
        store
            .create_item(json!({"file_hash": "h2", "data": {"total": 10}}))
            .await
            .unwrap();

        let removed = store.delete(&RecordFilter::eq("file_hash", "h1")).await.unwrap();
        assert_eq!(removed, 2);

        let left = store
            .list_items(&RecordFilter::eq("data.total", 10))
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].data["file_hash"], json!("h2"));
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        let invoices = SqliteRecordStore::open(&path, "invoices").await.unwrap();
        invoices.create_item(json!({"file_hash": "h1"})).await.unwrap();

        let other = SqliteRecordStore::open(&path, "receipts").await.unwrap();
        assert_eq!(other.delete(&RecordFilter::eq("file_hash", "h1")).await.unwrap(), 0);
        assert_eq!(
            invoices.list_items(&RecordFilter::default()).await.unwrap().len(),
            1
        );
    }
}
