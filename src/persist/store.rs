//! Backing table store
//!
//! Four logical tables. Channels, users and key-values are keyed by string
//! id; messages are keyed by `(channel, timestamp)` and can be read back by
//! timestamp range within one channel.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Logical tables of the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Channels,
    Users,
    Messages,
    KeyValues,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Channels, Table::Users, Table::Messages, Table::KeyValues];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Channels => "channels",
            Table::Users => "users",
            Table::Messages => "messages",
            Table::KeyValues => "key_values",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of a record within its table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKey {
    Id(String),
    /// `(partition, ordinal)`, e.g. `(channel, timestamp)`
    Compound(String, i64),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Id(id) => f.write_str(id),
            RecordKey::Compound(partition, ordinal) => write!(f, "{partition}@{ordinal}"),
        }
    }
}

/// Table plus record key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    pub table: Table,
    pub key: RecordKey,
}

impl StoreKey {
    pub fn new(table: Table, key: RecordKey) -> Self {
        Self { table, key }
    }

    pub fn channel(id: impl Into<String>) -> Self {
        Self::new(Table::Channels, RecordKey::Id(id.into()))
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(Table::Users, RecordKey::Id(id.into()))
    }

    pub fn message(channel: impl Into<String>, ts: i64) -> Self {
        Self::new(Table::Messages, RecordKey::Compound(channel.into(), ts))
    }

    pub fn key_value(key: impl Into<String>) -> Self {
        Self::new(Table::KeyValues, RecordKey::Id(key.into()))
    }

    /// Whether this key falls in `partition` within `[from, to)`
    pub fn in_range(&self, table: Table, partition: &str, from: i64, to: i64) -> bool {
        match &self.key {
            RecordKey::Compound(p, ordinal) => {
                self.table == table && p == partition && (from..to).contains(ordinal)
            }
            RecordKey::Id(_) => false,
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

/// Transactional table store behind the batcher.
///
/// Every call is one transaction: a `bulk_put` either stores all records or
/// fails as a whole.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Insert or replace `records`.
    async fn bulk_put(&self, table: Table, records: Vec<(RecordKey, Value)>) -> Result<()>;

    /// Fetch `keys`, returning one slot per key in order.
    async fn bulk_get(&self, table: Table, keys: Vec<RecordKey>) -> Result<Vec<Option<Value>>>;

    /// Records of `partition` whose ordinal lies in `[from, to)`, ordered by
    /// ordinal.
    async fn range(&self, table: Table, partition: &str, from: i64, to: i64) -> Result<Vec<(i64, Value)>>;
}

/// In-memory backing store for tests and ephemeral sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, BTreeMap<RecordKey, Value>>>,
    put_calls: AtomicU64,
    get_calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `bulk_put` calls served
    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    /// Number of `bulk_get` and `range` calls served
    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    pub async fn len(&self, table: Table) -> usize {
        self.tables.read().await.get(&table).map_or(0, BTreeMap::len)
    }

    /// Read one record without counting it as a store call
    pub async fn peek(&self, key: &StoreKey) -> Option<Value> {
        self.tables
            .read()
            .await
            .get(&key.table)
            .and_then(|rows| rows.get(&key.key))
            .cloned()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn bulk_put(&self, table: Table, records: Vec<(RecordKey, Value)>) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table).or_default();
        for (key, value) in records {
            rows.insert(key, value);
        }
        Ok(())
    }

    async fn bulk_get(&self, table: Table, keys: Vec<RecordKey>) -> Result<Vec<Option<Value>>> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables.read().await;
        let rows = tables.get(&table);
        Ok(keys
            .iter()
            .map(|key| rows.and_then(|rows| rows.get(key)).cloned())
            .collect())
    }

    async fn range(&self, table: Table, partition: &str, from: i64, to: i64) -> Result<Vec<(i64, Value)>> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        if from >= to {
            return Ok(Vec::new());
        }
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        let start = RecordKey::Compound(partition.to_string(), from);
        let end = RecordKey::Compound(partition.to_string(), to);
        Ok(rows
            .range(start..end)
            .filter_map(|(key, value)| match key {
                RecordKey::Compound(_, ordinal) => Some((*ordinal, value.clone())),
                RecordKey::Id(_) => None,
            })
            .collect())
    }
}
