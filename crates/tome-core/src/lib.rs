//! # tome-core: Pure Library Types and Merge Rules
//!
//! This crate holds everything the sync engine needs to *reason* about a
//! user's manga library without touching a disk, a socket or a clock.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tome Sync Architecture                           │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  Host application (UI + local DB)               │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ ChangeSource / LocalRepository         │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tome-sync (engine)                           │   │
//! │  │   EventQueue · ChangeCapture · SyncOrchestrator · Realtime      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tome-core (THIS CRATE) ★                        │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │  library  │  │   event   │  │ document  │  │   merge   │  │   │
//! │  │   │  Manga    │  │ SyncEvent │  │  Manga    │  │ LWW / OR  │  │   │
//! │  │   │  Chapter  │  │ SyncState │  │  Document │  │ MAX rules │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`library`] - Local library entities (Manga, Chapter, Category, ...)
//! - [`event`] - SyncEvent, queue keys, SyncState
//! - [`document`] - Remote document shapes (soft delete, denormalized chapters)
//! - [`merge`] - Conflict resolution (last-write-wins + monotonic merges)
//! - [`validation`] - Identifier and document validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use tome_core::merge::merge_progress;
//! use tome_core::library::ChapterProgress;
//!
//! let local = ChapterProgress { is_read: false, last_page_read: 5 };
//! let remote = ChapterProgress { is_read: true, last_page_read: 3 };
//!
//! // Read flag is OR-ed, page progress is MAX-ed
//! let merged = merge_progress(local, remote);
//! assert!(merged.is_read);
//! assert_eq!(merged.last_page_read, 5);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod document;
pub mod error;
pub mod event;
pub mod library;
pub mod merge;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use document::{
    CategoryDocument, ChapterDocument, Collection, DocumentPatch, HistoryDocument, MangaDocument,
    RemoteDocument, SettingsDocument,
};
pub use error::{CoreError, CoreResult, ValidationError};
pub use event::{
    event_key, format_timestamp, EntityType, EventKind, Priority, SyncEvent, SyncPhase, SyncState,
};
pub use library::{
    Category, Chapter, ChapterProgress, HistoryEntry, LibraryEntity, LibrarySettings, Manga,
    PublicationStatus,
};
pub use merge::{MangaMerge, MergeOutcome};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Identifier of the single settings document per user.
///
/// Settings are stored as one document, so every settings event shares this
/// entity id and therefore one queue key.
pub const SETTINGS_DOCUMENT_ID: &str = "preferences";

/// Maximum length of any entity identifier used in a document path.
pub const MAX_ENTITY_ID_LEN: usize = 256;
