//! # tome-store: Durable Storage for the Sync Engine
//!
//! Persists the engine's own state: the pending event snapshot and sync
//! metadata. The host application's library database is not touched here.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  EventQueue::persist / SyncOrchestrator::save_metadata (tome-sync)     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   tome-store (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │   KvStore     │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │ SqliteKvStore │    │  (embedded)  │  │   │
//! │  │   │  SqlitePool   │◄───│ MemoryKvStore │    │ 001_sync_... │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │   <data dir>/tome/sync.db                                      │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded migrations
//! - [`repository`] - [`KvStore`] trait and the SQLite implementation
//! - [`memory`] - In-memory [`KvStore`]
//! - [`error`] - Store error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tome_store::{Database, KvStore, StoreConfig};
//!
//! let db = Database::new(StoreConfig::new("sync.db")).await?;
//! let kv = db.kv();
//! kv.put("tome.sync.meta.v1", "{}").await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod memory;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use memory::MemoryKvStore;
pub use pool::{Database, StoreConfig};
pub use repository::kv::{KvEntry, SqliteKvStore};
pub use repository::KvStore;
