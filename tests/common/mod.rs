//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chat_store::persist::RecordKey;
use chat_store::store::HistoryRange;
use chat_store::{
    Channel, ChannelId, ChatApi, MemoryStore, Message, PersistentStore, Result, StoreConfig, StoreError, Table,
    User, UserId,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config whose drains run on the next scheduler turn
pub fn fast_config() -> StoreConfig {
    let mut config = StoreConfig::default();
    config.batcher.flush_delay_ms = 0;
    config
}

/// Poll `check` until it holds or about a second has passed
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Remote API
// =============================================================================

/// In-memory remote with per-endpoint call counters
#[derive(Default)]
pub struct ScriptedApi {
    pub channels: Mutex<HashMap<ChannelId, Channel>>,
    pub users: Mutex<HashMap<UserId, User>>,
    pub history: Mutex<Vec<Message>>,
    pub channel_calls: AtomicUsize,
    pub user_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
    pub offline: AtomicBool,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(self, channel: Channel) -> Self {
        self.channels.lock().insert(channel.id.clone(), channel);
        self
    }

    pub fn with_user(self, user: User) -> Self {
        self.users.lock().insert(user.id.clone(), user);
        self
    }

    pub fn with_messages(self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.history.lock().extend(messages);
        self
    }

    pub fn calls(&self) -> usize {
        self.channel_calls.load(Ordering::SeqCst)
            + self.user_calls.load(Ordering::SeqCst)
            + self.history_calls.load(Ordering::SeqCst)
    }

    fn reachable(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Network("offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatApi for ScriptedApi {
    async fn channel_info(&self, id: &ChannelId) -> Result<Channel> {
        self.channel_calls.fetch_add(1, Ordering::SeqCst);
        self.reachable()?;
        self.channels
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("channel {id}")))
    }

    async fn user_info(&self, id: &UserId) -> Result<User> {
        self.user_calls.fetch_add(1, Ordering::SeqCst);
        self.reachable()?;
        self.users
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    async fn message_history(&self, channel: &ChannelId, range: HistoryRange) -> Result<Vec<Message>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.reachable()?;
        Ok(self
            .history
            .lock()
            .iter()
            .filter(|message| &message.channel == channel && range.contains(message.ts))
            .cloned()
            .collect())
    }
}

// =============================================================================
// Instrumented backing stores
// =============================================================================

/// Fails every bulk write to one table
pub struct FailingStore {
    pub inner: MemoryStore,
    pub failing: Table,
}

impl FailingStore {
    pub fn new(failing: Table) -> Self {
        Self {
            inner: MemoryStore::new(),
            failing,
        }
    }
}

#[async_trait]
impl PersistentStore for FailingStore {
    async fn bulk_put(&self, table: Table, records: Vec<(RecordKey, Value)>) -> Result<()> {
        if table == self.failing {
            return Err(StoreError::Storage(format!("{table} is read-only")));
        }
        self.inner.bulk_put(table, records).await
    }

    async fn bulk_get(&self, table: Table, keys: Vec<RecordKey>) -> Result<Vec<Option<Value>>> {
        self.inner.bulk_get(table, keys).await
    }

    async fn range(&self, table: Table, partition: &str, from: i64, to: i64) -> Result<Vec<(i64, Value)>> {
        self.inner.range(table, partition, from, to).await
    }
}

/// Records the peak number of concurrent bulk writes
pub struct TrackingStore {
    pub inner: MemoryStore,
    pub delay: Duration,
    active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl TrackingStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PersistentStore for TrackingStore {
    async fn bulk_put(&self, table: Table, records: Vec<(RecordKey, Value)>) -> Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.bulk_put(table, records).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn bulk_get(&self, table: Table, keys: Vec<RecordKey>) -> Result<Vec<Option<Value>>> {
        self.inner.bulk_get(table, keys).await
    }

    async fn range(&self, table: Table, partition: &str, from: i64, to: i64) -> Result<Vec<(i64, Value)>> {
        self.inner.range(table, partition, from, to).await
    }
}

/// Holds every bulk write until `open` is called
pub struct GatedStore {
    pub inner: MemoryStore,
    gate: Semaphore,
}

impl GatedStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            gate: Semaphore::new(0),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(1024);
    }
}

#[async_trait]
impl PersistentStore for GatedStore {
    async fn bulk_put(&self, table: Table, records: Vec<(RecordKey, Value)>) -> Result<()> {
        let _permit = self.gate.acquire().await.map_err(|_| StoreError::Closed)?;
        self.inner.bulk_put(table, records).await
    }

    async fn bulk_get(&self, table: Table, keys: Vec<RecordKey>) -> Result<Vec<Option<Value>>> {
        self.inner.bulk_get(table, keys).await
    }

    async fn range(&self, table: Table, partition: &str, from: i64, to: i64) -> Result<Vec<(i64, Value)>> {
        self.inner.range(table, partition, from, to).await
    }
}
