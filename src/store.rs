//! Persistent instance metadata store backed by SQLite.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::error::{Result, ServerboxError};
use crate::types::{InstanceRecord, InstanceState};

/// Abstract store for instance records. The lifecycle manager is the sole
/// writer; readers may run concurrently.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Retrieve a record by instance id.
    async fn get(&self, id: &str) -> Result<Option<InstanceRecord>>;

    /// Insert or replace a record.
    async fn set(&self, record: &InstanceRecord) -> Result<()>;

    /// List all records, newest first.
    async fn list(&self) -> Result<Vec<InstanceRecord>>;

    /// Delete a record. Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Release the underlying connection. Further calls fail with a store
    /// error.
    async fn close(&self) -> Result<()>;
}

/// SQLite-backed store with a single `instances` table.
pub struct SqliteInstanceStore {
    conn: tokio::sync::Mutex<Option<rusqlite::Connection>>,
}

impl SqliteInstanceStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ServerboxError::Store(format!("create dir: {e}")))?;
            }
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| ServerboxError::Store(e.to_string()))?;

        // WAL mode for concurrent readers.
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| ServerboxError::Store(e.to_string()))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(Some(conn)),
        })
    }

    /// Open an in-memory store (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| ServerboxError::Store(e.to_string()))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: tokio::sync::Mutex::new(Some(conn)),
        })
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instances (
                id            TEXT PRIMARY KEY,
                sandbox_id    TEXT NOT NULL,
                state         TEXT NOT NULL,
                url           TEXT,
                preview_token TEXT,
                username      TEXT NOT NULL,
                password      TEXT NOT NULL,
                providers     TEXT NOT NULL DEFAULT '[]',
                labels        TEXT NOT NULL DEFAULT '{}',
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_created_at ON instances(created_at);",
        )
        .map_err(|e| ServerboxError::Store(e.to_string()))?;
        Ok(())
    }
}

const SELECT_COLUMNS: &str = "id, sandbox_id, state, url, preview_token, username, password,
            providers, labels, created_at, updated_at";

fn row_to_record(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<std::result::Result<InstanceRecord, ServerboxError>> {
    let state_raw: String = row.get(2)?;
    let providers_json: String = row.get(7)?;
    let labels_json: String = row.get(8)?;
    let created_raw: String = row.get(9)?;
    let updated_raw: String = row.get(10)?;

    let providers: Vec<String> = match serde_json::from_str(&providers_json) {
        Ok(value) => value,
        Err(e) => return Ok(Err(ServerboxError::Store(format!("providers column: {e}")))),
    };
    let labels: HashMap<String, String> = match serde_json::from_str(&labels_json) {
        Ok(value) => value,
        Err(e) => return Ok(Err(ServerboxError::Store(format!("labels column: {e}")))),
    };
    let created_at = match DateTime::parse_from_rfc3339(&created_raw) {
        Ok(value) => value.with_timezone(&Utc),
        Err(e) => return Ok(Err(ServerboxError::Store(format!("created_at column: {e}")))),
    };
    let updated_at = match DateTime::parse_from_rfc3339(&updated_raw) {
        Ok(value) => value.with_timezone(&Utc),
        Err(e) => return Ok(Err(ServerboxError::Store(format!("updated_at column: {e}")))),
    };

    Ok(Ok(InstanceRecord {
        id: row.get(0)?,
        sandbox_id: row.get(1)?,
        state: InstanceState::parse(&state_raw),
        url: row.get(3)?,
        preview_token: row.get(4)?,
        username: row.get(5)?,
        password: row.get(6)?,
        providers,
        labels,
        created_at,
        updated_at,
    }))
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn get(&self, id: &str) -> Result<Option<InstanceRecord>> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| ServerboxError::Store("store is closed".to_string()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM instances WHERE id = ?1"
            ))
            .map_err(|e| ServerboxError::Store(e.to_string()))?;

        let result = stmt
            .query_row(rusqlite::params![id], row_to_record)
            .optional()
            .map_err(|e| ServerboxError::Store(e.to_string()))?;

        match result {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn set(&self, record: &InstanceRecord) -> Result<()> {
        let providers_json = serde_json::to_string(&record.providers)
            .map_err(|e| ServerboxError::Store(e.to_string()))?;
        let labels_json = serde_json::to_string(&record.labels)
            .map_err(|e| ServerboxError::Store(e.to_string()))?;

        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| ServerboxError::Store("store is closed".to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO instances
                (id, sandbox_id, state, url, preview_token, username, password,
                 providers, labels, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            rusqlite::params![
                record.id,
                record.sandbox_id,
                record.state.as_str(),
                record.url,
                record.preview_token,
                record.username,
                record.password,
                providers_json,
                labels_json,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| ServerboxError::Store(e.to_string()))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceRecord>> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| ServerboxError::Store("store is closed".to_string()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM instances ORDER BY created_at DESC"
            ))
            .map_err(|e| ServerboxError::Store(e.to_string()))?;

        let rows = stmt
            .query_map([], row_to_record)
            .map_err(|e| ServerboxError::Store(e.to_string()))?;

        let mut records = Vec::new();
        for row_result in rows {
            let inner = row_result.map_err(|e| ServerboxError::Store(e.to_string()))?;
            records.push(inner?);
        }
        Ok(records)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| ServerboxError::Store("store is closed".to_string()))?;
        let rows = conn
            .execute("DELETE FROM instances WHERE id = ?1", rusqlite::params![id])
            .map_err(|e| ServerboxError::Store(e.to_string()))?;
        Ok(rows > 0)
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| ServerboxError::Store(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, created_at: DateTime<Utc>) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            sandbox_id: format!("sbx-{id}"),
            state: InstanceState::Running,
            url: Some("https://preview.example".to_string()),
            preview_token: Some("tok".to_string()),
            username: "opencode".to_string(),
            password: "secret".to_string(),
            providers: vec!["opencode".to_string(), "anthropic".to_string()],
            labels: HashMap::from([("team".to_string(), "core".to_string())]),
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        let rec = record("i-1", Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        store.set(&rec).await.unwrap();

        let loaded = store.get("i-1").await.unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_is_upsert() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        let mut rec = record("i-1", Utc::now());
        store.set(&rec).await.unwrap();

        rec.state = InstanceState::Stopped;
        rec.url = None;
        rec.preview_token = None;
        store.set(&rec).await.unwrap();

        let loaded = store.get("i-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, InstanceState::Stopped);
        assert!(loaded.url.is_none());
    }

    #[tokio::test]
    async fn list_orders_newest_first() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        let older = record("i-old", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let newer = record("i-new", Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        store.set(&older).await.unwrap();
        store.set(&newer).await.unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["i-new", "i-old"]);
    }

    #[tokio::test]
    async fn delete_reports_whether_row_existed() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        store.set(&record("i-1", Utc::now())).await.unwrap();

        assert!(store.delete("i-1").await.unwrap());
        assert!(!store.delete("i-1").await.unwrap());
        assert!(store.get("i-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_persisted_state_degrades_to_error() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        {
            let guard = store.conn.lock().await;
            guard
                .as_ref()
                .unwrap()
                .execute(
                    "INSERT INTO instances
                        (id, sandbox_id, state, url, preview_token, username, password,
                         providers, labels, created_at, updated_at)
                     VALUES ('i-1','sbx-1','wedged',NULL,NULL,'u','p','[]','{}',?1,?1)",
                    rusqlite::params![Utc::now().to_rfc3339()],
                )
                .unwrap();
        }

        let loaded = store.get("i-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, InstanceState::Error);
    }

    #[tokio::test]
    async fn close_rejects_further_calls() {
        let store = SqliteInstanceStore::open_in_memory().unwrap();
        store.close().await.unwrap();
        let err = store.get("i-1").await.unwrap_err();
        assert_eq!(err.code(), "STORE_ERROR");
    }

    #[tokio::test]
    async fn on_disk_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serverbox.db");

        let store = SqliteInstanceStore::open(&path).unwrap();
        store.set(&record("i-1", Utc::now())).await.unwrap();
        store.close().await.unwrap();

        let reopened = SqliteInstanceStore::open(&path).unwrap();
        assert!(reopened.get("i-1").await.unwrap().is_some());
    }
}
