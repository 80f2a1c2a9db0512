//! # Local Library Access
//!
//! The host application owns the on-device database. The engine reads it and
//! writes merged remote state into it only through [`LocalRepository`].
//!
//! ```text
//! ┌──────────────────────┐  get / list / chapters_for   ┌──────────────────┐
//! │  InboundApplier      │ ───────────────────────────► │  host database   │
//! │  SyncOrchestrator    │ ◄─────────────────────────── │  (any engine)    │
//! │                      │  write_transaction (atomic)  │                  │
//! └──────────────────────┘                              └──────────────────┘
//! ```

use async_trait::async_trait;
use tome_core::{Category, Chapter, EntityType, HistoryEntry, LibraryEntity, LibrarySettings, Manga};

use crate::error::{SyncError, SyncResult};

/// One change applied by [`LocalRepository::write_transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum LocalMutation {
    /// Insert or overwrite the entity.
    Upsert(LibraryEntity),
    /// Soft-delete the entity. Missing entities are ignored.
    Hide { entity_type: EntityType, id: String },
}

/// Read/write access to the host's library database.
#[async_trait]
pub trait LocalRepository: Send + Sync {
    /// Returns one entity, soft-deleted ones included.
    async fn get(&self, entity_type: EntityType, id: &str) -> SyncResult<Option<LibraryEntity>>;

    /// Returns every entity of a type, soft-deleted ones included.
    async fn list(&self, entity_type: EntityType) -> SyncResult<Vec<LibraryEntity>>;

    /// Returns the chapters of one manga.
    async fn chapters_for(&self, manga_id: &str) -> SyncResult<Vec<Chapter>>;

    /// Applies all mutations or none.
    async fn write_transaction(&self, mutations: Vec<LocalMutation>) -> SyncResult<()>;
}

// =============================================================================
// Typed Reads
// =============================================================================

fn wrong_type(expected: EntityType, got: &LibraryEntity) -> SyncError {
    SyncError::LocalReadFailed(format!(
        "expected {} '{}', repository returned {}",
        expected,
        got.id(),
        got.entity_type()
    ))
}

/// Reads a manga.
pub async fn get_manga(repo: &dyn LocalRepository, id: &str) -> SyncResult<Option<Manga>> {
    match repo.get(EntityType::Manga, id).await? {
        Some(LibraryEntity::Manga(m)) => Ok(Some(m)),
        Some(other) => Err(wrong_type(EntityType::Manga, &other)),
        None => Ok(None),
    }
}

/// Reads a category.
pub async fn get_category(repo: &dyn LocalRepository, id: &str) -> SyncResult<Option<Category>> {
    match repo.get(EntityType::Category, id).await? {
        Some(LibraryEntity::Category(c)) => Ok(Some(c)),
        Some(other) => Err(wrong_type(EntityType::Category, &other)),
        None => Ok(None),
    }
}

/// Reads a history entry.
pub async fn get_history(repo: &dyn LocalRepository, id: &str) -> SyncResult<Option<HistoryEntry>> {
    match repo.get(EntityType::History, id).await? {
        Some(LibraryEntity::History(h)) => Ok(Some(h)),
        Some(other) => Err(wrong_type(EntityType::History, &other)),
        None => Ok(None),
    }
}

/// Reads the settings document.
pub async fn get_settings(
    repo: &dyn LocalRepository,
    id: &str,
) -> SyncResult<Option<LibrarySettings>> {
    match repo.get(EntityType::Settings, id).await? {
        Some(LibraryEntity::Settings(s)) => Ok(Some(s)),
        Some(other) => Err(wrong_type(EntityType::Settings, &other)),
        None => Ok(None),
    }
}

// =============================================================================
// Local Snapshot
// =============================================================================

/// The whole local library, as uploaded by a full upload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalSnapshot {
    /// Each manga with its chapters.
    pub manga: Vec<(Manga, Vec<Chapter>)>,
    pub categories: Vec<Category>,
    pub history: Vec<HistoryEntry>,
    pub settings: Option<LibrarySettings>,
}

impl LocalSnapshot {
    /// Reads every synced entity from the repository.
    pub async fn collect(repo: &dyn LocalRepository) -> SyncResult<Self> {
        let mut snapshot = LocalSnapshot::default();

        for entity in repo.list(EntityType::Manga).await? {
            if let LibraryEntity::Manga(manga) = entity {
                let chapters = repo.chapters_for(&manga.id).await?;
                snapshot.manga.push((manga, chapters));
            }
        }
        for entity in repo.list(EntityType::Category).await? {
            if let LibraryEntity::Category(c) = entity {
                snapshot.categories.push(c);
            }
        }
        for entity in repo.list(EntityType::History).await? {
            if let LibraryEntity::History(h) = entity {
                snapshot.history.push(h);
            }
        }
        snapshot.settings = repo
            .list(EntityType::Settings)
            .await?
            .into_iter()
            .find_map(|entity| match entity {
                LibraryEntity::Settings(s) => Some(s),
                _ => None,
            });

        Ok(snapshot)
    }

    /// Number of documents an upload of this snapshot writes.
    pub fn document_count(&self) -> usize {
        self.manga.len()
            + self.categories.len()
            + self.history.len()
            + usize::from(self.settings.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.document_count() == 0
    }
}
