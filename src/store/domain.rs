//! Domain store: one cache per entity, wired to persistence and the
//! remote API
//!
//! Every entity resolves in the same order:
//!
//! 1. the in-memory cell, when its key is already registered and populated
//! 2. a batched read from the persistent store
//! 3. the remote [`ChatApi`], whose result is written back through the
//!    batcher
//!
//! Message pages resolve from a persisted range read first and only go to
//! the remote history call when persistence holds nothing for the window.
//! Each message a page load produces seeds its message cell, so opening a
//! page never issues one read per message.

use super::api::ChatApi;
use super::types::{Channel, ChannelId, HistoryRange, Message, MessageKey, MessagePageKey, Timestamp, User, UserId};
use crate::cache::{CacheStats, CellRegistry, EvictHook, KeyedCache, LruKeyedCache};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::persist::{Completion, DeferredIo, MemoryStore, PersistentStore, StoreKey, Table};
use crate::reactive::{source, ReactiveCell};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Snapshot of every cache's statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DomainStats {
    pub channels: CacheStats,
    pub users: CacheStats,
    pub messages: CacheStats,
    pub message_pages: CacheStats,
    pub key_values: CacheStats,
}

/// Composition root of the client data layer.
///
/// Owns the caches and the one batcher every cache persists through.
pub struct DomainStore {
    config: StoreConfig,
    api: Arc<dyn ChatApi>,
    io: DeferredIo,
    channels: KeyedCache<ChannelId, Channel>,
    users: KeyedCache<UserId, User>,
    messages: Arc<LruKeyedCache<MessageKey, Message, Message>>,
    message_pages: KeyedCache<MessagePageKey, Vec<MessageKey>>,
    key_values: KeyedCache<String, Value>,
}

impl DomainStore {
    pub fn new(
        config: StoreConfig,
        api: Arc<dyn ChatApi>,
        persistence: Arc<dyn PersistentStore>,
    ) -> Result<Self> {
        config.validate()?;
        let io = DeferredIo::new(persistence, config.batcher.clone())?;
        let window = config.page_window_secs;

        let channels: KeyedCache<ChannelId, Channel> = {
            let (api, io) = (Arc::clone(&api), io.clone());
            KeyedCache::builder("channels")
                .merge()
                .factory(move |id: &ChannelId, _| {
                    let (api, io, id) = (Arc::clone(&api), io.clone(), id.clone());
                    source::once(async move {
                        resolve(&io, StoreKey::channel(id.as_str()), || api.channel_info(&id))
                            .await
                            .map_err(|err| population("channel", &id, err))
                    })
                })
                .build()
        };

        let users: KeyedCache<UserId, User> = {
            let (api, io) = (Arc::clone(&api), io.clone());
            KeyedCache::builder("users")
                .merge()
                .factory(move |id: &UserId, _| {
                    let (api, io, id) = (Arc::clone(&api), io.clone(), id.clone());
                    source::once(async move {
                        resolve(&io, StoreKey::user(id.as_str()), || api.user_info(&id))
                            .await
                            .map_err(|err| population("user", &id, err))
                    })
                })
                .build()
        };

        let on_evict: EvictHook<MessageKey, Message> = {
            let io = io.clone();
            Arc::new(move |key: &MessageKey, last: Option<Message>| {
                if let Some(message) = last {
                    debug!(%key, "Flushing evicted message");
                    let _ = io.enqueue_record(key.store_key(), &message);
                }
            })
        };
        let messages: LruKeyedCache<MessageKey, Message, Message> = {
            let (api, io) = (Arc::clone(&api), io.clone());
            LruKeyedCache::builder("messages")
                .factory(move |key: &MessageKey, hint: Option<&Message>| {
                    if let Some(message) = hint {
                        return source::ready(message.clone());
                    }
                    let (api, io, key) = (Arc::clone(&api), io.clone(), key.clone());
                    source::once(async move {
                        resolve(&io, key.store_key(), || fetch_message(&*api, &key))
                            .await
                            .map_err(|err| population("message", &key, err))
                    })
                })
                .build_lru(config.message_capacity, Some(on_evict))?
        };
        let messages = Arc::new(messages);

        let message_pages: KeyedCache<MessagePageKey, Vec<MessageKey>> = {
            let (api, io, messages) = (Arc::clone(&api), io.clone(), Arc::clone(&messages));
            KeyedCache::builder("message_pages")
                .factory(move |page: &MessagePageKey, _| {
                    let (api, io, messages, page) =
                        (Arc::clone(&api), io.clone(), Arc::clone(&messages), page.clone());
                    source::once(async move {
                        load_page(&*api, &io, &messages, &page, window)
                            .await
                            .map_err(|err| population("message page", &page, err))
                    })
                })
                .build()
        };

        let key_values: KeyedCache<String, Value> = {
            let io = io.clone();
            KeyedCache::builder("key_values")
                .factory(move |key: &String, _| {
                    let (io, key) = (io.clone(), key.clone());
                    source::once(async move {
                        let stored = io
                            .enqueue_read(StoreKey::key_value(key.as_str()))
                            .await
                            .map_err(|err| population("key", &key, err))?;
                        Ok(stored.unwrap_or(Value::Null))
                    })
                })
                .build()
        };

        info!(
            message_capacity = config.message_capacity,
            page_window_secs = window,
            "Domain store ready"
        );

        Ok(Self {
            config,
            api,
            io,
            channels,
            users,
            messages,
            message_pages,
            key_values,
        })
    }

    /// Store backed by a fresh [`MemoryStore`]
    pub fn in_memory(config: StoreConfig, api: Arc<dyn ChatApi>) -> Result<Self> {
        Self::new(config, api, Arc::new(MemoryStore::new()))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn io(&self) -> &DeferredIo {
        &self.io
    }

    pub fn channels(&self) -> &KeyedCache<ChannelId, Channel> {
        &self.channels
    }

    pub fn users(&self) -> &KeyedCache<UserId, User> {
        &self.users
    }

    pub fn messages(&self) -> &LruKeyedCache<MessageKey, Message, Message> {
        &self.messages
    }

    pub fn message_pages(&self) -> &KeyedCache<MessagePageKey, Vec<MessageKey>> {
        &self.message_pages
    }

    pub fn key_values(&self) -> &KeyedCache<String, Value> {
        &self.key_values
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn channel(&self, id: &ChannelId) -> ReactiveCell<Channel> {
        self.channels.listen(id)
    }

    pub async fn get_channel(&self, id: &ChannelId) -> Result<Channel> {
        self.channels.get(id).await
    }

    /// Drop the cached channel and fetch it from the remote API, skipping
    /// persistence. The fresh record is written back.
    pub async fn refresh_channel(&self, id: &ChannelId) -> Result<Channel> {
        let cell = self.channels.listen(id);
        cell.invalidate();
        let (api, io, id) = (Arc::clone(&self.api), self.io.clone(), id.clone());
        cell.attach(source::once(async move {
            let channel = api.channel_info(&id).await?;
            let _ = io.enqueue_record(StoreKey::channel(id.as_str()), &channel);
            Ok(channel)
        }));
        cell.value().await
    }

    pub fn user(&self, id: &UserId) -> ReactiveCell<User> {
        self.users.listen(id)
    }

    pub async fn get_user(&self, id: &UserId) -> Result<User> {
        self.users.get(id).await
    }

    pub fn message(&self, key: &MessageKey) -> ReactiveCell<Message> {
        self.messages.listen(key)
    }

    pub async fn get_message(&self, key: &MessageKey) -> Result<Message> {
        self.messages.get(key).await
    }

    /// The page holding `ts` in `channel`
    pub fn page_key_for(&self, channel: &ChannelId, ts: Timestamp) -> MessagePageKey {
        MessagePageKey::new(channel.clone(), ts.page(self.config.page_window_secs))
    }

    /// Ordered message keys of one page
    pub fn message_page(&self, page: &MessagePageKey) -> ReactiveCell<Vec<MessageKey>> {
        self.message_pages.listen(page)
    }

    /// Messages of one page in timestamp order. Messages that fail to
    /// resolve are skipped.
    pub async fn page_messages(&self, page: &MessagePageKey) -> Result<Vec<Message>> {
        let keys = self.message_pages.get(page).await?;
        let resolved = self.messages.get_many(&keys).await;
        Ok(keys
            .iter()
            .zip(resolved)
            .filter_map(|(key, result)| match result {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(%key, error = %err, "Skipping unresolved message");
                    None
                }
            })
            .collect())
    }

    pub fn key_value(&self, key: &str) -> ReactiveCell<Value> {
        self.key_values.listen(&key.to_string())
    }

    /// Stored value for `key`, `null` when nothing is stored
    pub async fn get_key_value(&self, key: &str) -> Result<Value> {
        self.key_values.get(&key.to_string()).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Merge `update` into the channel's cell and persist the merged record.
    pub fn put_channel(&self, update: Channel) -> Completion<()> {
        let id = update.id.clone();
        let cell = self.channels.push(&id, update.clone());
        let merged = cell.peek().unwrap_or(update);
        self.io.enqueue_record(StoreKey::channel(id.as_str()), &merged)
    }

    /// Merge `update` into the user's cell and persist the merged record.
    pub fn put_user(&self, update: User) -> Completion<()> {
        let id = update.id.clone();
        let cell = self.users.push(&id, update.clone());
        let merged = cell.peek().unwrap_or(update);
        self.io.enqueue_record(StoreKey::user(id.as_str()), &merged)
    }

    /// Store `message`, persist it and add it to its page if that page is
    /// loaded.
    pub fn put_message(&self, message: Message) -> Completion<()> {
        let key = message.key();
        let written = self.io.enqueue_record(key.store_key(), &message);
        self.messages.push(&key, message);

        let page = key.page(self.config.page_window_secs);
        if let Some(cell) = self.message_pages.lookup(&page) {
            if let Some(mut keys) = cell.peek() {
                if let Err(at) = keys.binary_search(&key) {
                    keys.insert(at, key);
                    cell.push(keys);
                }
            }
        }
        written
    }

    pub fn set_key_value(&self, key: impl Into<String>, value: Value) -> Completion<()> {
        let key = key.into();
        let written = self.io.enqueue_write(StoreKey::key_value(key.as_str()), value.clone());
        self.key_values.push(&key, value);
        written
    }

    /// Commit every pending write and wait for it to settle
    pub async fn flush(&self) -> Result<()> {
        self.io.flush().await
    }

    pub fn stats(&self) -> DomainStats {
        DomainStats {
            channels: self.channels.stats(),
            users: self.users.stats(),
            messages: self.messages.stats(),
            message_pages: self.message_pages.stats(),
            key_values: self.key_values.stats(),
        }
    }
}

impl fmt::Debug for DomainStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainStore")
            .field("channels", &self.channels.len())
            .field("users", &self.users.len())
            .field("messages", &self.messages.len())
            .field("message_pages", &self.message_pages.len())
            .field("key_values", &self.key_values.len())
            .finish()
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Persistence first, then `fetch`. A fetched record is written back.
///
/// A failed or undecodable persistence read falls through to `fetch`.
async fn resolve<T, F, Fut>(io: &DeferredIo, key: StoreKey, fetch: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match io.enqueue_read(key.clone()).await {
        Ok(Some(value)) => match serde_json::from_value(value) {
            Ok(record) => {
                debug!(%key, "Resolved from persistence");
                return Ok(record);
            }
            Err(err) => warn!(%key, error = %err, "Discarding undecodable persisted record"),
        },
        Ok(None) => {}
        Err(err) => warn!(%key, error = %err, "Persistence read failed; fetching remotely"),
    }

    let record = fetch().await?;
    debug!(%key, "Resolved from remote");
    let _ = io.enqueue_record(key, &record);
    Ok(record)
}

async fn fetch_message(api: &dyn ChatApi, key: &MessageKey) -> Result<Message> {
    api.message_history(&key.channel, HistoryRange::at(key.ts))
        .await?
        .into_iter()
        .find(|message| message.ts == key.ts)
        .ok_or_else(|| StoreError::NotFound(format!("message {key}")))
}

/// Keys of one page, persisted range first, remote history otherwise.
///
/// Loaded messages refresh cells that already exist and seed new ones by
/// hint. When the page holds more messages than the message cache, only
/// the newest `capacity` are seeded.
async fn load_page(
    api: &dyn ChatApi,
    io: &DeferredIo,
    messages: &LruKeyedCache<MessageKey, Message, Message>,
    page: &MessagePageKey,
    window: i64,
) -> Result<Vec<MessageKey>> {
    let (from, to) = page.bounds(window);
    let stored = match io.enqueue_range(Table::Messages, page.channel.as_str(), from, to).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(%page, error = %err, "Persisted page read failed; fetching remotely");
            Vec::new()
        }
    };

    let loaded: Vec<Message> = if stored.is_empty() {
        let fetched = api.message_history(&page.channel, page.range(window)).await?;
        debug!(%page, count = fetched.len(), "Page fetched from remote");
        for message in &fetched {
            let _ = io.enqueue_record(message.key().store_key(), message);
        }
        fetched
    } else {
        debug!(%page, count = stored.len(), "Page resolved from persistence");
        stored
            .into_iter()
            .filter_map(|(ts, value)| match serde_json::from_value::<Message>(value) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(%page, ts, error = %err, "Skipping undecodable persisted message");
                    None
                }
            })
            .collect()
    };

    let mut loaded: Vec<Message> = loaded
        .into_iter()
        .filter(|message| page.contains(&message.key(), window))
        .collect();
    loaded.sort_by_key(|message| message.ts);
    loaded.dedup_by_key(|message| message.ts);

    let keys: Vec<MessageKey> = loaded.iter().map(Message::key).collect();
    // Seeding more than the cache holds would only evict the page's own
    // messages; the oldest overflow resolves through the batcher instead.
    let overflow = loaded.len().saturating_sub(messages.capacity());
    if overflow > 0 {
        debug!(%page, overflow, "Page exceeds message capacity; seeding newest only");
    }
    for message in loaded.into_iter().skip(overflow) {
        let key = message.key();
        match messages.lookup(&key) {
            Some(cell) => cell.push(message),
            None => {
                messages.listen_with(&key, Some(message));
            }
        }
    }
    Ok(keys)
}

fn population(entity: &str, key: &dyn fmt::Display, err: StoreError) -> StoreError {
    match err {
        StoreError::Population(_) => err,
        other => StoreError::Population(format!("{entity} {key}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeApi {
        channels: Mutex<HashMap<ChannelId, Channel>>,
        history: Mutex<Vec<Message>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatApi for FakeApi {
        async fn channel_info(&self, id: &ChannelId) -> Result<Channel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.channels
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        }

        async fn user_info(&self, id: &UserId) -> Result<User> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound(id.to_string()))
        }

        async fn message_history(&self, channel: &ChannelId, range: HistoryRange) -> Result<Vec<Message>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .history
                .lock()
                .iter()
                .filter(|m| &m.channel == channel && range.contains(m.ts))
                .cloned()
                .collect())
        }
    }

    fn config() -> StoreConfig {
        let mut config = StoreConfig::default();
        config.batcher.flush_delay_ms = 0;
        config.page_window_secs = 60;
        config
    }

    #[tokio::test]
    async fn test_channel_fetched_once_and_written_through() {
        let api = Arc::new(FakeApi::default());
        api.channels.lock().insert("c1".into(), Channel::named("c1", "general"));
        let persistence = Arc::new(MemoryStore::new());
        let store = DomainStore::new(config(), api.clone(), persistence.clone()).unwrap();

        let id = ChannelId::from("c1");
        assert_eq!(store.get_channel(&id).await.unwrap().name.as_deref(), Some("general"));
        assert_eq!(store.get_channel(&id).await.unwrap().name.as_deref(), Some("general"));
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        store.flush().await.unwrap();
        assert!(persistence.peek(&StoreKey::channel("c1")).await.is_some());
    }

    #[tokio::test]
    async fn test_missing_channel_is_population_error() {
        let store = DomainStore::in_memory(config(), Arc::new(FakeApi::default())).unwrap();
        let result = store.get_channel(&"nope".into()).await;
        assert!(matches!(result, Err(StoreError::Population(_))));
    }

    #[tokio::test]
    async fn test_page_seeds_message_cells() {
        let api = Arc::new(FakeApi::default());
        api.history.lock().extend([
            Message::new("c1", Timestamp(2_000), "second"),
            Message::new("c1", Timestamp(1_000), "first"),
            Message::new("c1", Timestamp(61_000), "next page"),
        ]);
        let store = DomainStore::in_memory(config(), api.clone()).unwrap();

        let page = store.page_key_for(&"c1".into(), Timestamp(1_500));
        let texts: Vec<String> = store
            .page_messages(&page)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reloaded_page_refreshes_existing_cells() {
        let api = Arc::new(FakeApi::default());
        api.history.lock().push(Message::new("c1", Timestamp(1_000), "first"));
        let store = DomainStore::in_memory(config(), api.clone()).unwrap();

        let page = store.page_key_for(&"c1".into(), Timestamp(1_000));
        let keys = store.message_page(&page).value().await.unwrap();
        let cell = store.messages().listen(&keys[0]);
        cell.push(Message::new("c1", Timestamp(1_000), "stale local copy"));

        store.message_pages().invalidate(&page);
        store.message_page(&page).value().await.unwrap();

        assert_eq!(cell.peek().map(|m| m.text).as_deref(), Some("first"));
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_page_larger_than_capacity_seeds_newest() {
        let api = Arc::new(FakeApi::default());
        api.history.lock().extend(
            (1..=4).map(|i| Message::new("c1", Timestamp(i * 1_000), format!("m{i}"))),
        );
        let mut config = config();
        config.message_capacity = 2;
        let store = DomainStore::in_memory(config, api.clone()).unwrap();

        let page = store.page_key_for(&"c1".into(), Timestamp(0));
        let keys = store.message_page(&page).value().await.unwrap();
        assert_eq!(keys.len(), 4);
        assert_eq!(store.messages().keys().len(), 2);
        assert!(store.messages().contains(&keys[3]));
        assert_eq!(store.stats().messages.evictions, 0);

        let texts: Vec<String> = store
            .page_messages(&page)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_absent_key_value_is_null() {
        let store = DomainStore::in_memory(config(), Arc::new(FakeApi::default())).unwrap();
        assert_eq!(store.get_key_value("theme").await.unwrap(), Value::Null);

        let _ = store.set_key_value("theme", Value::from("dark"));
        assert_eq!(store.get_key_value("theme").await.unwrap(), Value::from("dark"));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut bad = config();
        bad.message_capacity = 0;
        let result = DomainStore::in_memory(bad, Arc::new(FakeApi::default()));
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}
