//! Capacity-bounded keyed cache with least-recently-used eviction

use super::{CacheBuilder, CacheKey, CacheStats, CacheValue, CellRegistry, CellSpawner, StatsCounters};
use crate::reactive::ReactiveCell;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Receives an evicted key and the cell's last value, if it had one.
///
/// Runs while the cache is locked; it must not call back into the cache.
pub type EvictHook<K, V> = Arc<dyn Fn(&K, Option<V>) + Send + Sync>;

/// Bounded registry. When full, creating a cell evicts the least recently
/// listened-to one: its value goes to the eviction hook, its source is
/// detached, and only then is it removed.
///
/// `invalidate` removes the cell outright.
pub struct LruKeyedCache<K: CacheKey, V, H = ()> {
    spawner: CellSpawner<K, V, H>,
    cells: Mutex<LruCache<K, ReactiveCell<V>>>,
    on_evict: Option<EvictHook<K, V>>,
    stats: StatsCounters,
}

impl<K: CacheKey, V: CacheValue, H: CacheValue> LruKeyedCache<K, V, H> {
    pub fn builder(name: impl Into<String>) -> CacheBuilder<K, V, H> {
        CacheBuilder::new(name)
    }

    pub(crate) fn from_spawner(
        spawner: CellSpawner<K, V, H>,
        capacity: NonZeroUsize,
        on_evict: Option<EvictHook<K, V>>,
    ) -> Self {
        Self {
            spawner,
            cells: Mutex::new(LruCache::new(capacity)),
            on_evict,
            stats: StatsCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.spawner.name()
    }

    pub fn capacity(&self) -> usize {
        self.cells.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.lock().is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cells.lock().contains(key)
    }

    /// Evict the least recently used cell if inserting would exceed capacity.
    fn make_room(&self, cells: &mut LruCache<K, ReactiveCell<V>>) {
        if cells.len() < cells.cap().get() {
            return;
        }
        if let Some((key, cell)) = cells.peek_lru() {
            self.dispose(key, cell);
        }
        cells.pop_lru();
        self.stats.record_eviction();
    }

    fn dispose(&self, key: &K, cell: &ReactiveCell<V>) {
        debug!(cache = %self.name(), ?key, "Evicting cell");
        if let Some(hook) = &self.on_evict {
            hook(key, cell.peek());
        }
        cell.detach();
    }
}

impl<K: CacheKey, V: CacheValue, H: CacheValue> CellRegistry<K, V, H> for LruKeyedCache<K, V, H> {
    fn listen_with(&self, key: &K, hint: Option<H>) -> ReactiveCell<V> {
        let mut cells = self.cells.lock();
        if let Some(cell) = cells.get(key) {
            self.stats.record_hit();
            return cell.clone();
        }
        self.stats.record_miss();
        self.make_room(&mut cells);
        let cell = self.spawner.make(key, hint);
        cells.put(key.clone(), cell.clone());
        cell
    }

    fn lookup(&self, key: &K) -> Option<ReactiveCell<V>> {
        self.cells.lock().peek(key).cloned()
    }

    fn keys(&self) -> Vec<K> {
        self.cells.lock().iter().map(|(key, _)| key.clone()).collect()
    }

    fn set_direct(&self, key: K, cell: ReactiveCell<V>) {
        let mut cells = self.cells.lock();
        if !cells.contains(&key) {
            self.make_room(&mut cells);
        }
        if let Some(previous) = cells.put(key, cell.clone()) {
            if !previous.ptr_eq(&cell) {
                previous.detach();
            }
        }
    }

    fn remove(&self, key: &K) -> Option<ReactiveCell<V>> {
        let cell = self.cells.lock().pop(key)?;
        cell.detach();
        Some(cell)
    }

    fn invalidate(&self, key: &K) {
        let removed = self.cells.lock().pop(key);
        if let Some(cell) = removed {
            cell.invalidate();
            debug!(cache = %self.name(), ?key, "Invalidated and removed cell");
        }
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.len())
    }
}

impl<K: CacheKey, V, H> fmt::Debug for LruKeyedCache<K, V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells = self.cells.lock();
        f.debug_struct("LruKeyedCache")
            .field("name", &self.spawner.name)
            .field("entries", &cells.len())
            .field("capacity", &cells.cap())
            .finish()
    }
}
