//! # Repository Module
//!
//! Key-value persistence behind one trait.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  EventQueue / SyncOrchestrator (tome-sync)                             │
//! │       │                                                                 │
//! │       │  store.put("tome.sync.queue.v2", snapshot_json)                │
//! │       ▼                                                                 │
//! │  dyn KvStore                                                           │
//! │  ├── SqliteKvStore   (kv_entries table, transactional upsert)          │
//! │  └── MemoryKvStore   (BTreeMap, tests and emulators)                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Values are opaque strings. Each `put` replaces the whole value atomically.

use async_trait::async_trait;

use crate::error::StoreResult;

pub mod kv;

/// Durable string key-value storage.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value atomically.
    async fn put(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Lists stored keys in ascending order.
    async fn keys(&self) -> StoreResult<Vec<String>>;
}
