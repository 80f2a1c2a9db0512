//! # tome-sync: Library Sync Engine
//!
//! Keeps a reader's local manga library converged with a remote per-user
//! document store, across devices, with offline edits that survive restarts.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncEngine (engine.rs)                      │  │
//! │  │                                                                  │  │
//! │  │  Built once at app start, owns every background task            │  │
//! │  │  Reacts to sign-in / sign-out                                    │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ ChangeCapture  │  │SyncOrchestrator│  │  RealtimeBridge        │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Debounces host │  │ Drains queue   │  │ One listener per       │    │
//! │  │ DB changes     │  │ in batches,    │  │ collection, echo       │    │
//! │  │ into events    │  │ backoff, full  │  │ filter, catch-up on    │    │
//! │  │                │  │ up/download    │  │ reconnect              │    │
//! │  └───────┬────────┘  └───────▲────────┘  └───────────┬────────────┘    │
//! │          ▼                   │                       ▼                  │
//! │  ┌────────────────┐  ┌───────┴────────┐  ┌────────────────────────┐    │
//! │  │  EventQueue    │─►│ FlushScheduler │  │  InboundApplier        │    │
//! │  │                │  │                │  │                        │    │
//! │  │ One event per  │  │ Debounce and   │  │ Conflict resolution +  │    │
//! │  │ entity, durable│  │ periodic flush │  │ local write, capture   │    │
//! │  │ snapshot       │  │                │  │ suspended              │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  SEAMS (host supplies)                                                 │
//! │  • LocalRepository + ChangeSource: the on-device library database      │
//! │  • RemoteStore: the document store                                     │
//! │  • AuthBridge: the signed-in session                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Outbound
//! - [`capture`] - Local change notifications to debounced events
//! - [`queue`] - Deduplicating, priority-ordered, durable event queue
//! - [`persist`] - Queue snapshot and sync metadata on the key-value store
//! - [`orchestrator`] - Flush, download, upload, lifecycle
//! - [`scheduler`] - Debounce and periodic flush timers
//!
//! ### Inbound
//! - [`inbound`] - Merging remote documents into the local library
//! - [`realtime`] - Standing listeners with reconnect
//! - [`echo`] - Suppression of our own writes coming back
//!
//! ### Seams
//! - [`local`] - Host database access
//! - [`remote`] - Remote document store
//! - [`auth`] - Signed-in session
//!
//! ### Support
//! - [`engine`] - Wiring and app surface
//! - [`config`] - TOML + environment configuration
//! - [`clock`] - Monotonic event versions
//! - [`state`] - Observable sync state
//! - [`memory`] - In-memory store and library emulators
//! - [`fixtures`] - Entity builders
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tome_sync::{SyncConfig, SyncEngine};
//!
//! let config = SyncConfig::load_or_default(None);
//! let engine = SyncEngine::builder(config)
//!     .with_local(library.clone())
//!     .with_change_source(library)
//!     .with_remote(remote)
//!     .with_auth(auth)
//!     .build()
//!     .await?;
//!
//! let mut state = engine.subscribe_state();
//! while state.changed().await.is_ok() {
//!     println!("pending: {}", state.borrow().pending_count);
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Outbound
pub mod capture;
pub mod orchestrator;
pub mod persist;
pub mod queue;
pub mod scheduler;

// Inbound
pub mod echo;
pub mod inbound;
pub mod realtime;

// Seams
pub mod auth;
pub mod local;
pub mod remote;

// Support
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fixtures;
pub mod memory;
pub mod state;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{AuthBridge, AuthSession, AuthState, StaticAuth};
pub use capture::{ChangeCapture, ChangeSet, ChangeSink, ChangeSource, Subscription, SuspendToken};
pub use clock::{MonotonicClock, Stamp};
pub use config::{CaptureSettings, RealtimeSettings, StorageSettings, SyncConfig, SyncSettings};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{SyncError, SyncResult};
pub use inbound::{InboundApplier, MergeReport};
pub use local::{LocalMutation, LocalRepository, LocalSnapshot};
pub use memory::{FailureKind, MemoryLibrary, MemoryRemoteStore};
pub use orchestrator::{FlushReport, FlushSummary, RemoteSnapshot, SkipReason, SyncOrchestrator};
pub use persist::SyncMetadata;
pub use queue::{EnqueueOutcome, EventQueue, RequeueOutcome, RetryPolicy};
pub use realtime::{ListenerState, RealtimeBridge, RealtimeHandle};
pub use remote::{RawDocument, RemoteChange, RemoteQuery, RemoteStore, WriteBatch, WriteOp};
