//! SQLite-backed durable store.
//!
//! Persists every namespace in a single `records` table. The autoincrement
//! `seq` column is assigned on first insert and left alone by upserts, which
//! is what keeps `list_all` in insertion order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::store::{validate, DurableStore, Record};
use outpost_common::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    UNIQUE (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_records_stored_at ON records(namespace, stored_at);
"#;

/// Durable store on an embedded SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the file cannot be opened or migrated
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage_err)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        info!("SQLite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::StorageUnavailable("connection lock poisoned".to_string()))?;
            f(&guard).map_err(storage_err)
        })
        .await
        .map_err(|e| Error::StorageUnavailable(format!("storage task failed: {}", e)))?
    }
}

fn storage_err(err: rusqlite::Error) -> Error {
    Error::StorageUnavailable(err.to_string())
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[async_trait]
impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn put(&self, namespace: &str, record: Record) -> Result<()> {
        validate(namespace, Some(&record.key))?;
        debug!("Upserting {}/{}", namespace, record.key);

        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO records (namespace, key, value, stored_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (namespace, key)
                DO UPDATE SET value = excluded.value, stored_at = excluded.stored_at
                "#,
                params![
                    namespace,
                    record.key,
                    record.value,
                    record.stored_at.timestamp_millis()
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Record>> {
        validate(namespace, Some(key))?;

        let namespace = namespace.to_string();
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT key, value, stored_at FROM records WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| {
                    Ok(Record {
                        key: row.get(0)?,
                        value: row.get(1)?,
                        stored_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        validate(namespace, Some(key))?;
        debug!("Deleting {}/{}", namespace, key);

        let namespace = namespace.to_string();
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .map(|changed| changed > 0)
        })
        .await
    }

    async fn list_all(&self, namespace: &str) -> Result<Vec<Record>> {
        validate(namespace, None)?;

        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value, stored_at FROM records WHERE namespace = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map([namespace], |row| {
                Ok(Record {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    stored_at: from_millis(row.get(2)?),
                })
            })?;
            let records = rows.collect::<rusqlite::Result<Vec<_>>>();
            records
        })
        .await
    }

    async fn delete_older_than(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        validate(namespace, None)?;

        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM records WHERE namespace = ?1 AND stored_at < ?2",
                params![namespace, cutoff.timestamp_millis()],
            )
        })
        .await
    }

    async fn count(&self, namespace: &str) -> Result<usize> {
        validate(namespace, None)?;

        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM records WHERE namespace = ?1",
                [namespace],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as usize)
        })
        .await
    }
}
