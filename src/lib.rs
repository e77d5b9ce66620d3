//! Chat Store - Reactive Client Data Layer
//!
//! Client-side data layer for a desktop chat client. Every record the UI
//! shows lives in a reactive cell that fills itself on first use and
//! notifies its observers on every change.
//!
//! # Architecture
//!
//! - **Cells**: `ReactiveCell` holds one value, populates lazily from a
//!   factory and merges or overwrites pushed values
//! - **Caches**: `KeyedCache` / `LruKeyedCache` map keys to cells, one cell
//!   per key; the bounded variant flushes evicted values to persistence
//! - **Commands**: `Command` runs a producer single-flight and keeps the
//!   latest result observable
//! - **Models**: `Property` writes emit changing/changed pairs on a
//!   `ChangeBus`; `when` follows typed property chains through cells
//! - **Persistence**: `DeferredIo` batches reads and writes against a
//!   `PersistentStore` with bounded concurrency
//! - **Domain**: `DomainStore` resolves channels, users, messages and
//!   key-values through memory, persistence and the remote `ChatApi`
//!
//! # Example
//!
//! ```rust,ignore
//! use chat_store::{DomainStore, StoreConfig, ChannelId};
//!
//! let store = DomainStore::in_memory(StoreConfig::from_env(), api)?;
//!
//! // First access fetches; later ones are served from the cell
//! let channel = store.get_channel(&ChannelId::from("C024BE91L")).await?;
//!
//! // Observe instead of reading
//! let _sub = store.channel(&channel.id).subscribe(|event| println!("{event:?}"));
//! ```

// Error types
pub mod error;

// Store configuration
pub mod config;

// Reactive cells and sources
pub mod reactive;

// Keyed cell caches
pub mod cache;

// Single-flight commands
pub mod command;

// Change notification and property chains
pub mod model;

// Backing stores and the deferred I/O batcher
pub mod persist;

// Chat domain store
pub mod store;

// Re-export error types
pub use error::{Result, StoreError};

// Re-export configuration
pub use config::StoreConfig;

// Re-export reactive types
pub use reactive::{CellEvent, Merge, ReactiveCell, Source, Subscription, UpdateStrategy};

// Re-export cache types
pub use cache::{CacheBuilder, CacheStats, CellRegistry, KeyedCache, LruKeyedCache};

// Re-export command types
pub use command::{Command, Execution};

// Re-export model types
pub use model::{
    when, when2, when3, CellProperty, ChangeBus, ChangeNotification, ChangePhase, DerivedProperty, Observe,
    Property, PropertyPath, When,
};

// Re-export persistence types
#[cfg(feature = "native")]
pub use persist::SqliteStore;
pub use persist::{BatcherConfig, Completion, DeferredIo, MemoryStore, PersistentStore, StoreKey, Table};

// Re-export domain types
pub use store::{
    Channel, ChannelId, ChannelViewModel, ChatApi, DomainStore, Message, MessageKey, MessagePageKey, Timestamp,
    User, UserId,
};
