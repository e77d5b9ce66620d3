//! Deferred I/O batcher integration tests
//!
//! Covers:
//! - Read-your-writes while a bulk write is still in flight
//! - Failure isolation between tables sharing a drain
//! - Superseded writes reporting the outcome of their replacement
//! - The write concurrency bound
//! - Writes queued without a runtime

mod common;

use chat_store::persist::StoreKey;
use chat_store::{BatcherConfig, DeferredIo, MemoryStore, PersistentStore, StoreError, Table};
use common::{FailingStore, GatedStore, TrackingStore};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn immediate() -> BatcherConfig {
    BatcherConfig {
        flush_delay_ms: 0,
        ..BatcherConfig::default()
    }
}

#[tokio::test]
async fn test_read_resolves_to_in_flight_write() {
    common::init_tracing();
    let store = Arc::new(GatedStore::new());
    store
        .inner
        .bulk_put(Table::KeyValues, vec![(StoreKey::key_value("theme").key, json!("light"))])
        .await
        .unwrap();

    let backing: Arc<dyn PersistentStore> = store.clone();
    let io = DeferredIo::new(backing, immediate()).unwrap();

    let written = io.enqueue_write(StoreKey::key_value("theme"), json!({"mode": "dark", "_preview": true}));
    let read = io.enqueue_read(StoreKey::key_value("theme")).await.unwrap();
    assert_eq!(read, Some(json!({"mode": "dark"})));
    assert_eq!(io.stats().reads_from_pending, 1);

    store.open();
    written.await.unwrap();
    assert_eq!(
        store.inner.peek(&StoreKey::key_value("theme")).await,
        Some(json!({"mode": "dark"}))
    );

    let after = io.enqueue_read(StoreKey::key_value("theme")).await.unwrap();
    assert_eq!(after, Some(json!({"mode": "dark"})));
    assert_eq!(io.stats().reads_from_pending, 1);
}

#[tokio::test]
async fn test_failed_table_does_not_fail_other_items() {
    let store = Arc::new(FailingStore::new(Table::Users));
    let backing: Arc<dyn PersistentStore> = store.clone();
    let io = DeferredIo::new(backing, immediate()).unwrap();

    let channel = io.enqueue_write(StoreKey::channel("c1"), json!({"name": "general"}));
    let user = io.enqueue_write(StoreKey::user("u1"), json!({"name": "ada"}));

    assert!(channel.await.is_ok());
    match user.await {
        Err(StoreError::BatchItem { key, .. }) => assert_eq!(key, "users/u1"),
        other => panic!("expected batch item failure, got {other:?}"),
    }

    let stats = io.stats();
    assert_eq!(stats.writes_committed, 1);
    assert_eq!(stats.writes_failed, 1);
    assert!(store.inner.peek(&StoreKey::channel("c1")).await.is_some());
}

#[tokio::test]
async fn test_superseded_write_shares_failure_of_replacement() {
    let store = Arc::new(FailingStore::new(Table::KeyValues));
    let backing: Arc<dyn PersistentStore> = store.clone();
    let io = DeferredIo::new(backing, immediate()).unwrap();

    let first = io.enqueue_write(StoreKey::key_value("draft"), json!("hello"));
    let second = io.enqueue_write(StoreKey::key_value("draft"), json!("hello there"));

    for completion in [first, second] {
        match completion.await {
            Err(StoreError::BatchItem { key, .. }) => assert_eq!(key, "key_values/draft"),
            other => panic!("expected batch item failure, got {other:?}"),
        }
    }
    assert_eq!(io.stats().writes_superseded, 1);
    assert_eq!(io.stats().writes_failed, 1);
    assert_eq!(store.inner.peek(&StoreKey::key_value("draft")).await, None);
}

#[tokio::test]
async fn test_superseded_write_waits_across_chunks() {
    let store = Arc::new(FailingStore::new(Table::KeyValues));
    let backing: Arc<dyn PersistentStore> = store.clone();
    let config = BatcherConfig {
        batch_size: 1,
        flush_delay_ms: 0,
        ..BatcherConfig::default()
    };
    let io = DeferredIo::new(backing, config).unwrap();

    let first = io.enqueue_write(StoreKey::key_value("draft"), json!("hello"));
    let unrelated = io.enqueue_write(StoreKey::channel("c1"), json!({"name": "general"}));
    let second = io.enqueue_write(StoreKey::key_value("draft"), json!("hello there"));
    io.flush().await.unwrap();

    assert!(matches!(first.await, Err(StoreError::BatchItem { .. })));
    assert!(unrelated.await.is_ok());
    assert!(matches!(second.await, Err(StoreError::BatchItem { .. })));
    assert_eq!(io.stats().batches, 3);
}

#[tokio::test]
async fn test_bulk_writes_respect_concurrency_limit() {
    let store = Arc::new(TrackingStore::new(Duration::from_millis(20)));
    let backing: Arc<dyn PersistentStore> = store.clone();
    let config = BatcherConfig {
        batch_size: 1,
        flush_delay_ms: 0,
        write_concurrency: 2,
        read_concurrency: 1,
    };
    let io = DeferredIo::new(backing, config).unwrap();

    let completions: Vec<_> = (0..8)
        .map(|i| io.enqueue_write(StoreKey::key_value(format!("k{i}")), json!(i)))
        .collect();
    io.flush().await.unwrap();

    for completion in completions {
        completion.await.unwrap();
    }
    let peak = store.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency {peak}");
    assert_eq!(store.inner.len(Table::KeyValues).await, 8);
    assert_eq!(io.stats().batches, 8);
}

#[tokio::test]
async fn test_flush_waits_for_every_write() {
    let store = Arc::new(MemoryStore::new());
    let backing: Arc<dyn PersistentStore> = store.clone();
    let io = DeferredIo::new(
        backing,
        BatcherConfig {
            batch_size: 3,
            flush_delay_ms: 60_000,
            ..BatcherConfig::default()
        },
    )
    .unwrap();

    for i in 0..10 {
        let _ = io.enqueue_write(StoreKey::message("c1", i), json!({"ts": i}));
    }
    assert_eq!(io.queued_writes(), 10);

    io.flush().await.unwrap();
    assert_eq!(io.queued_writes(), 0);
    assert_eq!(store.len(Table::Messages).await, 10);
    assert_eq!(io.stats().batches, 4);
}

#[test]
fn test_writes_queued_outside_runtime_commit_on_flush() {
    let store = Arc::new(MemoryStore::new());
    let backing: Arc<dyn PersistentStore> = store.clone();
    let io = DeferredIo::new(backing, immediate()).unwrap();

    let written = io.enqueue_write(StoreKey::user("u1"), json!({"name": "ada"}));
    assert_eq!(io.queued_writes(), 1);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        io.flush().await.unwrap();
        written.await.unwrap();
        assert_eq!(store.peek(&StoreKey::user("u1")).await, Some(json!({"name": "ada"})));
    });
}

#[tokio::test]
async fn test_unserializable_record_rejected_up_front() {
    use std::collections::HashMap;

    let io = DeferredIo::new(Arc::new(MemoryStore::new()), immediate()).unwrap();
    // JSON object keys must be strings
    let record: HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
    let result = io.enqueue_record(StoreKey::key_value("bad"), &record).await;
    assert!(matches!(result, Err(StoreError::Serialization(_))));
    assert_eq!(io.queued_writes(), 0);
}
