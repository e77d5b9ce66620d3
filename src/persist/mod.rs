//! Persistence: backing table stores and the deferred I/O batcher

mod batcher;
#[cfg(feature = "native")]
mod sqlite;
mod store;

pub use batcher::{strip_transient, BatcherConfig, BatcherStats, Completion, DeferredIo};
#[cfg(feature = "native")]
pub use sqlite::SqliteStore;
pub use store::{MemoryStore, PersistentStore, RecordKey, StoreKey, Table};
