//! Deferred persistence I/O
//!
//! Coalesces the many small reads and writes issued while the UI is busy
//! into bounded background batches:
//! - Writes queue up and are committed in chunks of `batch_size`, one bulk
//!   write per table, with at most `write_concurrency` bulk writes running
//! - Reads queue up separately; a read for a key with a pending write
//!   resolves to that write's value, the rest are fetched in bulk with at
//!   most `read_concurrency` fetches running
//! - Both drains start `flush_delay` after the first enqueue and keep
//!   draining one chunk per turn until their queue is empty
//!
//! Top-level object fields starting with `_` are local-only and never reach
//! the backing store.
//!
//! Drains run on the ambient Tokio runtime. Writes enqueued outside one
//! stay queued until `flush()`.

use super::store::{PersistentStore, RecordKey, StoreKey, Table};
use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, error, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the deferred I/O batcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Maximum items per drain chunk
    pub batch_size: usize,
    /// Delay before a scheduled drain runs, in milliseconds
    pub flush_delay_ms: u64,
    /// Maximum concurrent bulk writes
    pub write_concurrency: usize,
    /// Maximum concurrent bulk reads
    pub read_concurrency: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_delay_ms: 16,
            write_concurrency: 4,
            read_concurrency: 4,
        }
    }
}

impl BatcherConfig {
    /// Small chunks, short delay
    pub fn for_interactive() -> Self {
        Self {
            batch_size: 20,
            flush_delay_ms: 8,
            write_concurrency: 2,
            read_concurrency: 4,
        }
    }

    /// Large chunks for imports and history backfill
    pub fn for_bulk() -> Self {
        Self {
            batch_size: 500,
            flush_delay_ms: 250,
            write_concurrency: 8,
            read_concurrency: 8,
        }
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(StoreError::Config("batcher.batch_size must be non-zero".into()));
        }
        if self.write_concurrency == 0 || self.read_concurrency == 0 {
            return Err(StoreError::Config("batcher concurrency limits must be non-zero".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Completions
// =============================================================================

/// Resolves once when the batch carrying an item settles.
#[must_use = "a completion does nothing unless awaited; dropping it does not cancel the item"]
pub struct Completion<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Completion<T> {
    fn ready(result: Result<T>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { receiver }
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(StoreError::Closed)))
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct BatcherCounters {
    writes_committed: AtomicU64,
    writes_failed: AtomicU64,
    writes_superseded: AtomicU64,
    reads_served: AtomicU64,
    reads_from_pending: AtomicU64,
    batches: AtomicU64,
}

impl BatcherCounters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Snapshot of batcher statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatcherStats {
    /// Writes persisted by a bulk write
    pub writes_committed: u64,
    /// Writes whose bulk write failed
    pub writes_failed: u64,
    /// Writes replaced by a later write to the same key before committing
    pub writes_superseded: u64,
    /// Keyed reads resolved, from either source
    pub reads_served: u64,
    /// Keyed reads resolved from a pending write
    pub reads_from_pending: u64,
    /// Write chunks committed
    pub batches: u64,
}

// =============================================================================
// Queues
// =============================================================================

struct WriteItem {
    key: StoreKey,
    value: Value,
    seq: u64,
    done: oneshot::Sender<Result<()>>,
}

struct ReadItem {
    key: StoreKey,
    done: oneshot::Sender<Result<Option<Value>>>,
}

struct RangeItem {
    table: Table,
    partition: String,
    from: i64,
    to: i64,
    done: oneshot::Sender<Result<Vec<(i64, Value)>>>,
}

struct ReadBatch {
    keys: Vec<ReadItem>,
    /// Each range with the pending writes that fall inside it
    ranges: Vec<(RangeItem, Vec<(i64, Value)>)>,
}

/// Latest not-yet-persisted value for one key
struct PendingWrite {
    seq: u64,
    value: Value,
    /// Queued or in-flight writes to this key, the latest included
    unsettled: usize,
    /// Outcome of the latest write once its bulk write returns
    settled: Option<Result<()>>,
    /// Completions of superseded writes, resolved with the latest outcome
    parked: Vec<oneshot::Sender<Result<()>>>,
}

#[derive(Default)]
struct Queues {
    writes: VecDeque<WriteItem>,
    reads: VecDeque<ReadItem>,
    ranges: VecDeque<RangeItem>,
    pending: HashMap<StoreKey, PendingWrite>,
    next_seq: u64,
    /// Writes taken off the queue but not yet settled
    outstanding_writes: usize,
    write_drain_scheduled: bool,
    read_drain_scheduled: bool,
}

struct IoInner {
    store: Arc<dyn PersistentStore>,
    config: BatcherConfig,
    queues: Mutex<Queues>,
    write_permits: Arc<Semaphore>,
    read_permits: Arc<Semaphore>,
    settled: watch::Sender<u64>,
    stats: BatcherCounters,
}

/// Deferred, batched access to a [`PersistentStore`].
///
/// Cheap to clone; clones share queues and limits.
#[derive(Clone)]
pub struct DeferredIo {
    inner: Arc<IoInner>,
}

impl DeferredIo {
    pub fn new(store: Arc<dyn PersistentStore>, config: BatcherConfig) -> Result<Self> {
        config.validate()?;
        let (settled, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(IoInner {
                store,
                write_permits: Arc::new(Semaphore::new(config.write_concurrency)),
                read_permits: Arc::new(Semaphore::new(config.read_concurrency)),
                config,
                queues: Mutex::new(Queues::default()),
                settled,
                stats: BatcherCounters::default(),
            }),
        })
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn PersistentStore> {
        Arc::clone(&self.inner.store)
    }

    /// Writes queued and not yet taken by a drain
    pub fn queued_writes(&self) -> usize {
        self.inner.queues.lock().writes.len()
    }

    pub fn stats(&self) -> BatcherStats {
        let stats = &self.inner.stats;
        BatcherStats {
            writes_committed: stats.writes_committed.load(Ordering::Relaxed),
            writes_failed: stats.writes_failed.load(Ordering::Relaxed),
            writes_superseded: stats.writes_superseded.load(Ordering::Relaxed),
            reads_served: stats.reads_served.load(Ordering::Relaxed),
            reads_from_pending: stats.reads_from_pending.load(Ordering::Relaxed),
            batches: stats.batches.load(Ordering::Relaxed),
        }
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Queue a write.
    ///
    /// A later write to the same key queued before this one commits
    /// supersedes it. The superseded write is never sent to the store and
    /// its completion resolves with the outcome of the latest write.
    pub fn enqueue_write(&self, key: StoreKey, value: Value) -> Completion<()> {
        let (done, receiver) = oneshot::channel();
        let schedule = {
            let mut queues = self.inner.queues.lock();
            queues.next_seq += 1;
            let seq = queues.next_seq;
            let pending = queues.pending.entry(key.clone()).or_insert_with(|| PendingWrite {
                seq,
                value: Value::Null,
                unsettled: 0,
                settled: None,
                parked: Vec::new(),
            });
            pending.seq = seq;
            pending.value = value.clone();
            pending.unsettled += 1;
            pending.settled = None;
            queues.writes.push_back(WriteItem {
                key,
                value,
                seq,
                done,
            });
            !std::mem::replace(&mut queues.write_drain_scheduled, true)
        };
        if schedule {
            self.schedule_writes();
        }
        Completion { receiver }
    }

    /// Serialize `record` and queue it.
    pub fn enqueue_record<T: Serialize>(&self, key: StoreKey, record: &T) -> Completion<()> {
        match serde_json::to_value(record) {
            Ok(value) => self.enqueue_write(key, value),
            Err(err) => {
                warn!(%key, error = %err, "Record not serializable; skipping write");
                Completion::ready(Err(err.into()))
            }
        }
    }

    /// Commit every queued write now and wait until all in-flight bulk
    /// writes have settled.
    pub async fn flush(&self) -> Result<()> {
        let mut settled = self.inner.settled.subscribe();
        while let Some(chunk) = self.take_writes(false) {
            self.dispatch_writes(chunk).await;
        }
        loop {
            {
                let queues = self.inner.queues.lock();
                if queues.writes.is_empty() && queues.outstanding_writes == 0 {
                    return Ok(());
                }
            }
            settled.changed().await.map_err(|_| StoreError::Closed)?;
        }
    }

    fn schedule_writes(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No Tokio runtime; writes stay queued until flush()");
            self.inner.queues.lock().write_drain_scheduled = false;
            return;
        };
        let io = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(io.inner.config.flush_delay()).await;
            while let Some(chunk) = io.take_writes(true) {
                io.dispatch_writes(chunk).await;
                tokio::task::yield_now().await;
            }
        });
    }

    /// Take the next chunk. A finishing drain that finds the queue empty
    /// unschedules itself under the same lock.
    fn take_writes(&self, finishing: bool) -> Option<Vec<WriteItem>> {
        let mut queues = self.inner.queues.lock();
        if queues.writes.is_empty() {
            if finishing {
                queues.write_drain_scheduled = false;
            }
            return None;
        }
        let n = self.inner.config.batch_size.min(queues.writes.len());
        let chunk: Vec<WriteItem> = queues.writes.drain(..n).collect();
        queues.outstanding_writes += chunk.len();
        Some(chunk)
    }

    async fn dispatch_writes(&self, chunk: Vec<WriteItem>) {
        match Arc::clone(&self.inner.write_permits).acquire_owned().await {
            Ok(permit) => {
                let io = self.clone();
                tokio::spawn(async move {
                    io.commit(chunk).await;
                    drop(permit);
                });
            }
            Err(_) => {
                let count = chunk.len();
                self.settle(chunk, |_| Err(StoreError::Closed));
                self.release_writes(count);
            }
        }
    }

    async fn commit(&self, chunk: Vec<WriteItem>) {
        let count = chunk.len();
        BatcherCounters::add(&self.inner.stats.batches, 1);

        let mut tables: BTreeMap<Table, Vec<WriteItem>> = BTreeMap::new();
        for item in chunk {
            tables.entry(item.key.table).or_default().push(item);
        }

        for (table, items) in tables {
            let current = self.park_superseded(items);
            if current.is_empty() {
                continue;
            }

            let records: Vec<(RecordKey, Value)> = current
                .iter()
                .map(|item| (item.key.key.clone(), strip_transient(&item.value)))
                .collect();

            match self.inner.store.bulk_put(table, records).await {
                Ok(()) => {
                    debug!(%table, count = current.len(), "Committed write batch");
                    BatcherCounters::add(&self.inner.stats.writes_committed, current.len());
                    self.settle(current, |_| Ok(()));
                }
                Err(err) => {
                    error!(%table, count = current.len(), error = %err, "Bulk write failed");
                    BatcherCounters::add(&self.inner.stats.writes_failed, current.len());
                    let message = err.to_string();
                    self.settle(current, |key| {
                        Err(StoreError::BatchItem {
                            key: key.to_string(),
                            message: message.clone(),
                        })
                    });
                }
            }
        }

        self.release_writes(count);
    }

    /// Keep the items still holding the latest value for their key. Items a
    /// later write replaced take that write's outcome: now if it has
    /// already settled, otherwise once it does.
    fn park_superseded(&self, items: Vec<WriteItem>) -> Vec<WriteItem> {
        let mut current = Vec::with_capacity(items.len());
        let mut resolved = Vec::new();
        {
            let mut queues = self.inner.queues.lock();
            for item in items {
                let Some(pending) = queues.pending.get_mut(&item.key) else {
                    current.push(item);
                    continue;
                };
                if pending.seq == item.seq {
                    current.push(item);
                    continue;
                }

                BatcherCounters::add(&self.inner.stats.writes_superseded, 1);
                pending.unsettled = pending.unsettled.saturating_sub(1);
                match &pending.settled {
                    Some(outcome) => resolved.push((item.done, outcome.clone())),
                    None => pending.parked.push(item.done),
                }
                if pending.unsettled == 0 && pending.parked.is_empty() {
                    queues.pending.remove(&item.key);
                }
            }
        }
        for (done, outcome) in resolved {
            let _ = done.send(outcome);
        }
        current
    }

    /// Resolve committed (or abandoned) items and the superseded writes
    /// parked behind them.
    fn settle<F>(&self, items: Vec<WriteItem>, outcome_for: F)
    where
        F: Fn(&StoreKey) -> Result<()>,
    {
        let mut resolved = Vec::new();
        {
            let mut queues = self.inner.queues.lock();
            for item in items {
                let outcome = outcome_for(&item.key);
                if let Some(pending) = queues.pending.get_mut(&item.key) {
                    pending.unsettled = pending.unsettled.saturating_sub(1);
                    if pending.seq == item.seq {
                        pending.settled = Some(outcome.clone());
                        resolved.extend(pending.parked.drain(..).map(|done| (done, outcome.clone())));
                    }
                    if pending.unsettled == 0 && pending.parked.is_empty() {
                        queues.pending.remove(&item.key);
                    }
                }
                resolved.push((item.done, outcome));
            }
        }
        for (done, outcome) in resolved {
            let _ = done.send(outcome);
        }
    }

    fn release_writes(&self, count: usize) {
        {
            let mut queues = self.inner.queues.lock();
            queues.outstanding_writes = queues.outstanding_writes.saturating_sub(count);
        }
        self.inner.settled.send_modify(|n| *n += 1);
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Queue a keyed read. Resolves to `None` when the key is not stored.
    pub fn enqueue_read(&self, key: StoreKey) -> Completion<Option<Value>> {
        let (done, receiver) = oneshot::channel();
        let schedule = {
            let mut queues = self.inner.queues.lock();
            queues.reads.push_back(ReadItem { key, done });
            !std::mem::replace(&mut queues.read_drain_scheduled, true)
        };
        if schedule {
            self.schedule_reads();
        }
        Completion { receiver }
    }

    /// Queue a range read over `partition` with ordinals in `[from, to)`.
    /// Pending writes in the range override stored records.
    pub fn enqueue_range(
        &self,
        table: Table,
        partition: impl Into<String>,
        from: i64,
        to: i64,
    ) -> Completion<Vec<(i64, Value)>> {
        let (done, receiver) = oneshot::channel();
        let schedule = {
            let mut queues = self.inner.queues.lock();
            queues.ranges.push_back(RangeItem {
                table,
                partition: partition.into(),
                from,
                to,
                done,
            });
            !std::mem::replace(&mut queues.read_drain_scheduled, true)
        };
        if schedule {
            self.schedule_reads();
        }
        Completion { receiver }
    }

    fn schedule_reads(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No Tokio runtime; reads stay queued until one is available");
            self.inner.queues.lock().read_drain_scheduled = false;
            return;
        };
        let io = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(io.inner.config.flush_delay()).await;
            while let Some(batch) = io.take_reads() {
                io.dispatch_reads(batch).await;
                tokio::task::yield_now().await;
            }
        });
    }

    /// Take the next chunk of reads, resolving those with a pending write
    /// on the spot.
    fn take_reads(&self) -> Option<ReadBatch> {
        let mut guard = self.inner.queues.lock();
        let queues = &mut *guard;
        if queues.reads.is_empty() && queues.ranges.is_empty() {
            queues.read_drain_scheduled = false;
            return None;
        }

        let batch_size = self.inner.config.batch_size;
        let n = batch_size.min(queues.reads.len());
        let mut keys = Vec::new();
        let mut from_pending = 0;
        for item in queues.reads.drain(..n) {
            match queues.pending.get(&item.key) {
                Some(pending) => {
                    from_pending += 1;
                    let _ = item.done.send(Ok(Some(strip_transient(&pending.value))));
                }
                None => keys.push(item),
            }
        }
        BatcherCounters::add(&self.inner.stats.reads_from_pending, from_pending);
        BatcherCounters::add(&self.inner.stats.reads_served, from_pending);

        let m = batch_size.min(queues.ranges.len());
        let pending = &queues.pending;
        let ranges = queues
            .ranges
            .drain(..m)
            .map(|item| {
                let overlay = pending
                    .iter()
                    .filter(|(key, _)| key.in_range(item.table, &item.partition, item.from, item.to))
                    .filter_map(|(key, pending)| match &key.key {
                        RecordKey::Compound(_, ordinal) => Some((*ordinal, strip_transient(&pending.value))),
                        RecordKey::Id(_) => None,
                    })
                    .collect();
                (item, overlay)
            })
            .collect();

        Some(ReadBatch { keys, ranges })
    }

    async fn dispatch_reads(&self, batch: ReadBatch) {
        if batch.keys.is_empty() && batch.ranges.is_empty() {
            return;
        }
        match Arc::clone(&self.inner.read_permits).acquire_owned().await {
            Ok(permit) => {
                let io = self.clone();
                tokio::spawn(async move {
                    io.fetch(batch).await;
                    drop(permit);
                });
            }
            Err(_) => {
                for item in batch.keys {
                    let _ = item.done.send(Err(StoreError::Closed));
                }
                for (item, _) in batch.ranges {
                    let _ = item.done.send(Err(StoreError::Closed));
                }
            }
        }
    }

    async fn fetch(&self, batch: ReadBatch) {
        let mut tables: BTreeMap<Table, Vec<ReadItem>> = BTreeMap::new();
        for item in batch.keys {
            tables.entry(item.key.table).or_default().push(item);
        }

        for (table, items) in tables {
            let keys = items.iter().map(|item| item.key.key.clone()).collect();
            match self.inner.store.bulk_get(table, keys).await {
                Ok(values) => {
                    BatcherCounters::add(&self.inner.stats.reads_served, items.len());
                    let mut values = values.into_iter();
                    for item in items {
                        let _ = item.done.send(Ok(values.next().flatten()));
                    }
                }
                Err(err) => {
                    warn!(%table, count = items.len(), error = %err, "Bulk read failed");
                    let message = err.to_string();
                    for item in items {
                        let _ = item.done.send(Err(StoreError::BatchItem {
                            key: item.key.to_string(),
                            message: message.clone(),
                        }));
                    }
                }
            }
        }

        for (item, overlay) in batch.ranges {
            let result = self
                .inner
                .store
                .range(item.table, &item.partition, item.from, item.to)
                .await
                .map(|rows| {
                    let mut merged: BTreeMap<i64, Value> = rows.into_iter().collect();
                    merged.extend(overlay);
                    merged.into_iter().collect()
                });
            if let Err(err) = &result {
                warn!(table = %item.table, partition = %item.partition, error = %err, "Range read failed");
            }
            let _ = item.done.send(result);
        }
    }
}

impl fmt::Debug for DeferredIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.inner.queues.lock();
        f.debug_struct("DeferredIo")
            .field("config", &self.inner.config)
            .field("queued_writes", &queues.writes.len())
            .field("queued_reads", &(queues.reads.len() + queues.ranges.len()))
            .field("pending", &queues.pending.len())
            .finish()
    }
}

/// Copy of `value` without its local-only (`_`-prefixed) top-level fields.
pub fn strip_transient(value: &Value) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(name, _)| !name.starts_with('_'))
                .map(|(name, field)| (name.clone(), field.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStore;
    use serde_json::json;

    fn batcher(store: Arc<MemoryStore>, batch_size: usize) -> DeferredIo {
        let config = BatcherConfig {
            batch_size,
            flush_delay_ms: 1,
            ..BatcherConfig::default()
        };
        DeferredIo::new(store, config).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(BatcherConfig::default().validate().is_ok());
        assert!(BatcherConfig::for_bulk().validate().is_ok());
        let zero = BatcherConfig {
            write_concurrency: 0,
            ..BatcherConfig::default()
        };
        assert!(matches!(zero.validate(), Err(StoreError::Config(_))));
    }

    #[test]
    fn test_strip_transient() {
        let value = json!({"name": "general", "_typing": ["u1"]});
        assert_eq!(strip_transient(&value), json!({"name": "general"}));
        assert_eq!(strip_transient(&json!(3)), json!(3));
    }

    #[tokio::test]
    async fn test_read_sees_pending_write() {
        let store = Arc::new(MemoryStore::new());
        store
            .bulk_put(Table::Users, vec![(RecordKey::Id("u1".into()), json!({"name": "stale"}))])
            .await
            .unwrap();
        let io = batcher(Arc::clone(&store), 50);

        let write = io.enqueue_write(StoreKey::user("u1"), json!({"name": "fresh"}));
        let read = io.enqueue_read(StoreKey::user("u1"));

        assert_eq!(read.await, Ok(Some(json!({"name": "fresh"}))));
        assert_eq!(write.await, Ok(()));
        assert_eq!(store.peek(&StoreKey::user("u1")).await, Some(json!({"name": "fresh"})));
    }

    #[tokio::test]
    async fn test_writes_are_chunked() {
        let store = Arc::new(MemoryStore::new());
        let io = batcher(Arc::clone(&store), 50);

        let completions: Vec<_> = (0..120)
            .map(|i| io.enqueue_write(StoreKey::channel(format!("c{i}")), json!({"i": i})))
            .collect();
        for completion in completions {
            completion.await.unwrap();
        }

        assert_eq!(store.put_calls(), 3);
        assert_eq!(store.len(Table::Channels).await, 120);
        assert_eq!(io.stats().batches, 3);
    }

    #[tokio::test]
    async fn test_later_write_supersedes_queued_one() {
        let store = Arc::new(MemoryStore::new());
        let io = batcher(Arc::clone(&store), 50);

        let first = io.enqueue_write(StoreKey::key_value("theme"), json!("light"));
        let second = io.enqueue_write(StoreKey::key_value("theme"), json!("dark"));
        io.flush().await.unwrap();

        assert_eq!(first.await, Ok(()));
        assert_eq!(second.await, Ok(()));
        assert_eq!(store.peek(&StoreKey::key_value("theme")).await, Some(json!("dark")));
        assert_eq!(io.stats().writes_superseded, 1);
        assert_eq!(io.stats().writes_committed, 1);
    }

    #[tokio::test]
    async fn test_transient_fields_never_persisted() {
        let store = Arc::new(MemoryStore::new());
        let io = batcher(Arc::clone(&store), 50);

        let _ = io.enqueue_write(StoreKey::channel("c1"), json!({"name": "general", "_typing": true}));
        let read = io.enqueue_read(StoreKey::channel("c1")).await.unwrap();
        io.flush().await.unwrap();

        assert_eq!(read, Some(json!({"name": "general"})));
        assert_eq!(store.peek(&StoreKey::channel("c1")).await, Some(json!({"name": "general"})));
    }

    #[tokio::test]
    async fn test_range_merges_pending_writes() {
        let store = Arc::new(MemoryStore::new());
        store
            .bulk_put(
                Table::Messages,
                vec![
                    (RecordKey::Compound("c1".into(), 1), json!("one")),
                    (RecordKey::Compound("c1".into(), 2), json!("two")),
                ],
            )
            .await
            .unwrap();
        let io = batcher(Arc::clone(&store), 50);

        let _ = io.enqueue_write(StoreKey::message("c1", 2), json!("two edited"));
        let _ = io.enqueue_write(StoreKey::message("c1", 3), json!("three"));
        let _ = io.enqueue_write(StoreKey::message("c1", 9), json!("outside"));
        let rows = io.enqueue_range(Table::Messages, "c1", 0, 5).await.unwrap();

        assert_eq!(
            rows,
            vec![(1, json!("one")), (2, json!("two edited")), (3, json!("three"))]
        );
    }

    #[tokio::test]
    async fn test_enqueue_record_serializes() {
        #[derive(Serialize)]
        struct Prefs {
            theme: &'static str,
        }

        let store = Arc::new(MemoryStore::new());
        let io = batcher(Arc::clone(&store), 50);
        io.enqueue_record(StoreKey::key_value("prefs"), &Prefs { theme: "dark" })
            .await
            .unwrap();

        assert_eq!(
            store.peek(&StoreKey::key_value("prefs")).await,
            Some(json!({"theme": "dark"}))
        );
    }
}
