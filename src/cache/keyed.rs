//! Unbounded keyed cache

use super::{CacheBuilder, CacheKey, CacheStats, CacheValue, CellRegistry, CellSpawner, StatsCounters};
use crate::reactive::ReactiveCell;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use tracing::debug;

/// Registry holding one cell per key until the key is removed.
///
/// `invalidate` keeps the cell registered so existing subscribers see the
/// refetched value.
pub struct KeyedCache<K, V, H = ()> {
    spawner: CellSpawner<K, V, H>,
    cells: DashMap<K, ReactiveCell<V>>,
    stats: StatsCounters,
}

impl<K: CacheKey, V: CacheValue, H: CacheValue> KeyedCache<K, V, H> {
    pub fn builder(name: impl Into<String>) -> CacheBuilder<K, V, H> {
        CacheBuilder::new(name)
    }

    pub(crate) fn from_spawner(spawner: CellSpawner<K, V, H>) -> Self {
        Self {
            spawner,
            cells: DashMap::new(),
            stats: StatsCounters::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.spawner.name()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cells.contains_key(key)
    }
}

impl<K: CacheKey, V: CacheValue, H: CacheValue> CellRegistry<K, V, H> for KeyedCache<K, V, H> {
    fn listen_with(&self, key: &K, hint: Option<H>) -> ReactiveCell<V> {
        match self.cells.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.stats.record_hit();
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                self.stats.record_miss();
                entry.insert(self.spawner.make(key, hint)).value().clone()
            }
        }
    }

    fn lookup(&self, key: &K) -> Option<ReactiveCell<V>> {
        self.cells.get(key).map(|cell| cell.value().clone())
    }

    fn keys(&self) -> Vec<K> {
        self.cells.iter().map(|entry| entry.key().clone()).collect()
    }

    fn set_direct(&self, key: K, cell: ReactiveCell<V>) {
        if let Some(previous) = self.cells.insert(key, cell.clone()) {
            if !previous.ptr_eq(&cell) {
                previous.detach();
            }
        }
    }

    fn remove(&self, key: &K) -> Option<ReactiveCell<V>> {
        let (_, cell) = self.cells.remove(key)?;
        cell.detach();
        debug!(cache = %self.name(), ?key, "Removed cell");
        Some(cell)
    }

    fn invalidate(&self, key: &K) {
        if let Some(cell) = self.lookup(key) {
            cell.invalidate();
        }
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.cells.len())
    }
}

impl<K: CacheKey, V, H> fmt::Debug for KeyedCache<K, V, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("name", &self.spawner.name)
            .field("entries", &self.cells.len())
            .finish()
    }
}
