//! Keyed registries of reactive cells
//!
//! A cache maps each key to exactly one [`ReactiveCell`]. Cells are created
//! on first `listen` and bound to the cache's factory; the factory only runs
//! when the cell is first read or subscribed to.
//!
//! Two variants share the [`CellRegistry`] surface:
//! - [`KeyedCache`]: unbounded, cells live until removed
//! - [`LruKeyedCache`]: bounded, least recently used cells are flushed
//!   through an eviction hook and detached before removal

mod keyed;
mod lru;

pub use keyed::KeyedCache;
pub use lru::{EvictHook, LruKeyedCache};

use crate::error::{Result, StoreError};
use crate::reactive::{Merge, Merger, ReactiveCell, Source};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Keys usable in a cell registry
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> CacheKey for T {}

/// Values (and hints) usable in a cell registry
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> CacheValue for T {}

/// Produces the population source for a key, optionally seeded by a hint.
pub type KeyFactory<K, V, H> = Arc<dyn Fn(&K, Option<&H>) -> Source<V> + Send + Sync>;

// =============================================================================
// Registry surface
// =============================================================================

/// Operations shared by every keyed cache variant.
///
/// Implementors provide storage; the convenience operations are derived.
#[async_trait]
pub trait CellRegistry<K: CacheKey, V: CacheValue, H: CacheValue = ()>: Send + Sync {
    /// Return the cell for `key`, creating it with `hint` if absent.
    ///
    /// The hint only seeds the first population of a newly created cell.
    fn listen_with(&self, key: &K, hint: Option<H>) -> ReactiveCell<V>;

    /// Return the registered cell without creating one.
    fn lookup(&self, key: &K) -> Option<ReactiveCell<V>>;

    fn keys(&self) -> Vec<K>;

    /// Replace the registered cell. The previous cell's source is detached.
    fn set_direct(&self, key: K, cell: ReactiveCell<V>);

    /// Drop `key` from the registry, detaching its source.
    fn remove(&self, key: &K) -> Option<ReactiveCell<V>>;

    /// Detach the source and drop the value for `key`.
    fn invalidate(&self, key: &K);

    fn stats(&self) -> CacheStats;

    fn listen(&self, key: &K) -> ReactiveCell<V> {
        self.listen_with(key, None)
    }

    fn listen_many(&self, keys: &[K]) -> Vec<ReactiveCell<V>> {
        keys.iter().map(|key| self.listen(key)).collect()
    }

    /// Every registered cell. Never creates cells.
    fn listen_all(&self) -> Vec<(K, ReactiveCell<V>)> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.lookup(&key).map(|cell| (key, cell)))
            .collect()
    }

    /// First resolved value for `key`.
    async fn get(&self, key: &K) -> Result<V> {
        self.listen(key).value().await
    }

    async fn get_many(&self, keys: &[K]) -> Vec<Result<V>> {
        let cells = self.listen_many(keys);
        join_all(cells.iter().map(ReactiveCell::value)).await
    }

    /// Attach `source` to the cell for `key`, keeping the cell's identity.
    fn set_lazy(&self, key: &K, source: Source<V>) {
        self.listen(key).attach(source);
    }

    /// Push `value` into the cell for `key` using the cache's strategy.
    fn push(&self, key: &K, value: V) -> ReactiveCell<V> {
        let cell = self.listen(key);
        cell.push(value);
        cell
    }
}

// =============================================================================
// Shared construction
// =============================================================================

/// Creates the cells of one cache. Embedded by each variant.
pub(crate) struct CellSpawner<K, V, H> {
    name: String,
    factory: Option<KeyFactory<K, V, H>>,
    merger: Option<Merger<V>>,
}

impl<K: CacheKey, V: CacheValue, H: CacheValue> CellSpawner<K, V, H> {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn make(&self, key: &K, hint: Option<H>) -> ReactiveCell<V> {
        let mut builder = ReactiveCell::builder()
            .label(format!("{}[{:?}]", self.name, key))
            .merger(self.merger);

        if let Some(factory) = &self.factory {
            let factory = Arc::clone(factory);
            let key = key.clone();
            let hint = Mutex::new(hint);
            builder = builder.factory(move || {
                let hint = hint.lock().take();
                factory(&key, hint.as_ref())
            });
        }
        builder.build()
    }
}

/// Builder shared by both cache variants
pub struct CacheBuilder<K, V, H = ()> {
    spawner: CellSpawner<K, V, H>,
}

impl<K: CacheKey, V: CacheValue, H: CacheValue> CacheBuilder<K, V, H> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spawner: CellSpawner {
                name: name.into(),
                factory: None,
                merger: None,
            },
        }
    }

    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&K, Option<&H>) -> Source<V> + Send + Sync + 'static,
    {
        self.spawner.factory = Some(Arc::new(factory));
        self
    }

    /// Cells merge pushed values instead of replacing them
    pub fn merge(mut self) -> Self
    where
        V: Merge,
    {
        self.spawner.merger = Some(Merger::of());
        self
    }

    pub fn build(self) -> KeyedCache<K, V, H> {
        KeyedCache::from_spawner(self.spawner)
    }

    /// Bounded variant. `on_evict` receives each evicted key and its last
    /// value before the cell is detached.
    pub fn build_lru(
        self,
        capacity: usize,
        on_evict: Option<EvictHook<K, V>>,
    ) -> Result<LruKeyedCache<K, V, H>> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            StoreError::Config(format!("{}: cache capacity must be non-zero", self.spawner.name))
        })?;
        Ok(LruKeyedCache::from_spawner(self.spawner, capacity, on_evict))
    }
}

// =============================================================================
// Cache Statistics
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, entries: usize) -> CacheStats {
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Cells currently registered
    pub entries: usize,
    /// `listen` calls that found an existing cell
    pub hits: u64,
    /// `listen` calls that created a cell
    pub misses: u64,
    /// Cells evicted for capacity
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
