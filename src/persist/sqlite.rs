//! SQLite backing store
//!
//! One SQL table per logical table. Records are stored as JSON text; the
//! messages table has a compound `(partition, ordinal)` primary key so
//! range reads are index scans.
//!
//! The connection is opened on first use and shared by every caller.
//! Blocking SQLite work runs on the blocking thread pool.

use super::store::{PersistentStore, RecordKey, Table};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS channels (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS key_values (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS messages (
        partition TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        data TEXT NOT NULL,
        PRIMARY KEY (partition, ordinal)
    );
";

/// SQLite-backed [`PersistentStore`]
pub struct SqliteStore {
    path: PathBuf,
    connection: OnceCell<Arc<Mutex<Connection>>>,
}

impl SqliteStore {
    /// Store backed by the database file at `path`. Nothing is opened until
    /// the first call.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connection: OnceCell::new(),
        }
    }

    /// Private in-memory database
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let path = self.path.clone();
                let connection = tokio::task::spawn_blocking(move || open(&path)).await??;
                Ok::<_, StoreError>(Arc::new(Mutex::new(connection)))
            })
            .await?;
        Ok(Arc::clone(connection))
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let connection = self.connection().await?;
        tokio::task::spawn_blocking(move || {
            let mut connection = connection.lock();
            f(&mut connection)
        })
        .await?
    }
}

fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Storage(format!("creating {}: {}", parent.display(), e)))?;
    }
    let connection = Connection::open(path)?;
    connection.execute_batch("PRAGMA journal_mode=WAL;")?;
    connection.execute_batch(SCHEMA)?;
    info!(path = %path.display(), "SQLite store opened");
    Ok(connection)
}

fn decode(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}

fn wrong_key(table: Table, key: &RecordKey) -> StoreError {
    StoreError::Storage(format!("key {key} does not fit table {table}"))
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn bulk_put(&self, table: Table, records: Vec<(RecordKey, Value)>) -> Result<()> {
        let count = records.len();
        self.with_connection(move |connection| {
            let tx = connection.transaction()?;
            {
                let sql = match table {
                    Table::Messages => "INSERT INTO messages (partition, ordinal, data) VALUES (?1, ?2, ?3)
                         ON CONFLICT(partition, ordinal) DO UPDATE SET data = excluded.data"
                        .to_string(),
                    other => format!(
                        "INSERT INTO {} (id, data) VALUES (?1, ?2)
                         ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                        other.as_str()
                    ),
                };
                let mut stmt = tx.prepare_cached(&sql)?;
                for (key, value) in &records {
                    let data = serde_json::to_string(value)?;
                    match (table, key) {
                        (Table::Messages, RecordKey::Compound(partition, ordinal)) => {
                            stmt.execute(params![partition, ordinal, data])?;
                        }
                        (Table::Messages, _) | (_, RecordKey::Compound(..)) => {
                            return Err(wrong_key(table, key));
                        }
                        (_, RecordKey::Id(id)) => {
                            stmt.execute(params![id, data])?;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        debug!(%table, count, "SQLite bulk put");
        Ok(())
    }

    async fn bulk_get(&self, table: Table, keys: Vec<RecordKey>) -> Result<Vec<Option<Value>>> {
        self.with_connection(move |connection| {
            let sql = match table {
                Table::Messages => "SELECT data FROM messages WHERE partition = ?1 AND ordinal = ?2".to_string(),
                other => format!("SELECT data FROM {} WHERE id = ?1", other.as_str()),
            };
            let mut stmt = connection.prepare_cached(&sql)?;
            let mut values = Vec::with_capacity(keys.len());
            for key in &keys {
                let text: Option<String> = match (table, key) {
                    (Table::Messages, RecordKey::Compound(partition, ordinal)) => stmt
                        .query_row(params![partition, ordinal], |row| row.get(0))
                        .optional()?,
                    (Table::Messages, _) | (_, RecordKey::Compound(..)) => None,
                    (_, RecordKey::Id(id)) => stmt.query_row(params![id], |row| row.get(0)).optional()?,
                };
                values.push(text.as_deref().map(decode).transpose()?);
            }
            Ok(values)
        })
        .await
    }

    async fn range(&self, table: Table, partition: &str, from: i64, to: i64) -> Result<Vec<(i64, Value)>> {
        if table != Table::Messages || from >= to {
            return Ok(Vec::new());
        }
        let partition = partition.to_string();
        self.with_connection(move |connection| {
            let mut stmt = connection.prepare_cached(
                "SELECT ordinal, data FROM messages
                 WHERE partition = ?1 AND ordinal >= ?2 AND ordinal < ?3
                 ORDER BY ordinal",
            )?;
            let rows = stmt.query_map(params![partition, from, to], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut records = Vec::new();
            for row in rows {
                let (ordinal, text) = row?;
                records.push((ordinal, decode(&text)?));
            }
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");

        let store = SqliteStore::new(&path);
        store
            .bulk_put(Table::Channels, vec![(RecordKey::Id("c1".into()), json!({"name": "general"}))])
            .await
            .unwrap();
        drop(store);

        let reopened = SqliteStore::new(&path);
        let got = reopened
            .bulk_get(Table::Channels, vec![RecordKey::Id("c1".into()), RecordKey::Id("c2".into())])
            .await
            .unwrap();
        assert_eq!(got, vec![Some(json!({"name": "general"})), None]);
    }

    #[tokio::test]
    async fn test_message_range() {
        let store = SqliteStore::in_memory();
        let records = (0..5)
            .map(|i| (RecordKey::Compound("c1".into(), i * 10), json!({"ts": i * 10})))
            .collect();
        store.bulk_put(Table::Messages, records).await.unwrap();

        let rows = store.range(Table::Messages, "c1", 10, 30).await.unwrap();
        let ordinals: Vec<i64> = rows.iter().map(|(ordinal, _)| *ordinal).collect();
        assert_eq!(ordinals, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = SqliteStore::in_memory();
        for theme in ["light", "dark"] {
            store
                .bulk_put(Table::KeyValues, vec![(RecordKey::Id("theme".into()), json!(theme))])
                .await
                .unwrap();
        }
        let got = store
            .bulk_get(Table::KeyValues, vec![RecordKey::Id("theme".into())])
            .await
            .unwrap();
        assert_eq!(got, vec![Some(json!("dark"))]);
    }

    #[tokio::test]
    async fn test_mismatched_key_rejected() {
        let store = SqliteStore::in_memory();
        let result = store
            .bulk_put(Table::Messages, vec![(RecordKey::Id("m".into()), json!(1))])
            .await;
        assert!(matches!(result, Err(StoreError::Storage(_))));
    }
}
