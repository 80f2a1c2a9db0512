//! # Library Types
//!
//! Local library entities as the host application stores them.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Library Entities                               │
//! │                                                                         │
//! │  ┌──────────────┐ 1    * ┌──────────────┐                              │
//! │  │    Manga     │───────►│   Chapter    │  is_read, last_page_read     │
//! │  │ title, cover │        │              │  (monotonic under merge)     │
//! │  │ genres       │        └──────────────┘                              │
//! │  │ category_ids │─────┐                                                │
//! │  └──────────────┘     │ *  ┌──────────────┐                            │
//! │         ▲             └───►│   Category   │                            │
//! │         │                  └──────────────┘                            │
//! │  ┌──────┴───────┐                                                      │
//! │  │ HistoryEntry │  last_read per chapter                               │
//! │  └──────────────┘                                                      │
//! │                                                                         │
//! │  ┌──────────────┐                                                      │
//! │  │LibrarySettings│ one document of key/value preferences               │
//! │  └──────────────┘                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timestamps
//! Every entity carries `modified` as epoch milliseconds. It is the only
//! input to last-write-wins decisions; no field-level clocks are kept.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::event::{EntityType, SyncEvent};

// =============================================================================
// Publication Status
// =============================================================================

/// Publication status reported by the manga's source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    #[default]
    Unknown,
    Ongoing,
    Completed,
    Licensed,
    Cancelled,
    Hiatus,
}

// =============================================================================
// Manga
// =============================================================================

/// A manga in the user's library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Manga {
    /// Stable identifier shared by every device.
    pub id: String,

    /// Source (catalogue) the manga was added from.
    pub source: String,

    /// URL of the manga on its source.
    pub url: String,

    pub title: String,

    #[serde(default)]
    pub author: Option<String>,

    #[serde(default)]
    pub artist: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub cover_url: Option<String>,

    #[serde(default)]
    pub status: PublicationStatus,

    /// Genre tags. Replaced wholesale on merge.
    #[serde(default)]
    pub genres: Vec<String>,

    /// Categories this manga is filed under. Replaced wholesale on merge.
    #[serde(default)]
    pub category_ids: Vec<String>,

    /// Whether the manga is in the library (as opposed to only browsed).
    #[serde(default)]
    pub favorite: bool,

    /// When the manga was added to the library (epoch ms).
    #[serde(default)]
    pub date_added: i64,

    /// Last modification (epoch ms).
    pub modified: i64,

    /// Soft-delete flag. Deleted entries are hidden, never removed.
    #[serde(default)]
    pub deleted: bool,
}

// =============================================================================
// Chapter
// =============================================================================

/// Read state of one chapter.
///
/// Both fields only move forward under merge: `is_read` is OR-ed and
/// `last_page_read` is MAX-ed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChapterProgress {
    pub is_read: bool,
    pub last_page_read: u32,
}

/// A chapter of a manga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Chapter {
    pub id: String,

    /// Owning manga.
    pub manga_id: String,

    #[serde(default)]
    pub url: String,

    pub name: String,

    /// Chapter number as published (may be fractional, e.g. 10.5).
    #[serde(default)]
    pub number: f32,

    #[serde(default)]
    pub is_read: bool,

    #[serde(default)]
    pub last_page_read: u32,

    #[serde(default)]
    pub bookmarked: bool,

    /// Upload date on the source (epoch ms).
    #[serde(default)]
    pub date_upload: i64,

    pub modified: i64,

    #[serde(default)]
    pub deleted: bool,
}

impl Chapter {
    /// Returns the read state of this chapter.
    pub fn progress(&self) -> ChapterProgress {
        ChapterProgress {
            is_read: self.is_read,
            last_page_read: self.last_page_read,
        }
    }

    /// Overwrites the read state of this chapter.
    pub fn set_progress(&mut self, progress: ChapterProgress) {
        self.is_read = progress.is_read;
        self.last_page_read = progress.last_page_read;
    }
}

// =============================================================================
// Category
// =============================================================================

/// A user-defined library category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Category {
    pub id: String,
    pub name: String,

    /// Position in the category list.
    #[serde(default)]
    pub sort_order: i32,

    /// Display/sort flags, opaque to the sync engine.
    #[serde(default)]
    pub flags: i64,

    pub modified: i64,

    #[serde(default)]
    pub deleted: bool,
}

// =============================================================================
// History
// =============================================================================

/// Reading history for one chapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HistoryEntry {
    pub id: String,
    pub manga_id: String,
    pub chapter_id: String,

    /// Last time the chapter was opened (epoch ms).
    pub last_read: i64,

    /// Accumulated reading time (ms).
    #[serde(default)]
    pub time_read_ms: i64,

    pub modified: i64,

    #[serde(default)]
    pub deleted: bool,
}

// =============================================================================
// Settings
// =============================================================================

/// Synced user preferences, stored as a single key/value document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LibrarySettings {
    pub id: String,

    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,

    pub modified: i64,
}

// =============================================================================
// Library Entity (tagged union)
// =============================================================================

/// Any synced local entity.
///
/// Used by change notifications, local writes and event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", content = "data", rename_all = "snake_case")]
pub enum LibraryEntity {
    Manga(Manga),
    Chapter(Chapter),
    Category(Category),
    History(HistoryEntry),
    Settings(LibrarySettings),
}

impl LibraryEntity {
    /// Returns the entity type.
    pub fn entity_type(&self) -> EntityType {
        match self {
            LibraryEntity::Manga(_) => EntityType::Manga,
            LibraryEntity::Chapter(_) => EntityType::Chapter,
            LibraryEntity::Category(_) => EntityType::Category,
            LibraryEntity::History(_) => EntityType::History,
            LibraryEntity::Settings(_) => EntityType::Settings,
        }
    }

    /// Returns the entity id.
    pub fn id(&self) -> &str {
        match self {
            LibraryEntity::Manga(m) => &m.id,
            LibraryEntity::Chapter(c) => &c.id,
            LibraryEntity::Category(c) => &c.id,
            LibraryEntity::History(h) => &h.id,
            LibraryEntity::Settings(s) => &s.id,
        }
    }

    /// Id of the remote document the entity is written into.
    pub fn document_id(&self) -> &str {
        match self {
            LibraryEntity::Chapter(c) => &c.manga_id,
            other => other.id(),
        }
    }

    /// Returns the last-modified timestamp (epoch ms).
    pub fn modified(&self) -> i64 {
        match self {
            LibraryEntity::Manga(m) => m.modified,
            LibraryEntity::Chapter(c) => c.modified,
            LibraryEntity::Category(c) => c.modified,
            LibraryEntity::History(h) => h.modified,
            LibraryEntity::Settings(s) => s.modified,
        }
    }

    /// Returns true if the entity is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        match self {
            LibraryEntity::Manga(m) => m.deleted,
            LibraryEntity::Chapter(c) => c.deleted,
            LibraryEntity::Category(c) => c.deleted,
            LibraryEntity::History(h) => h.deleted,
            LibraryEntity::Settings(_) => false,
        }
    }

    /// Marks the entity as soft-deleted at the given time.
    ///
    /// Settings cannot be deleted; only `modified` moves.
    pub fn mark_deleted(&mut self, modified: i64) {
        match self {
            LibraryEntity::Manga(m) => {
                m.deleted = true;
                m.modified = modified;
            }
            LibraryEntity::Chapter(c) => {
                c.deleted = true;
                c.modified = modified;
            }
            LibraryEntity::Category(c) => {
                c.deleted = true;
                c.modified = modified;
            }
            LibraryEntity::History(h) => {
                h.deleted = true;
                h.modified = modified;
            }
            LibraryEntity::Settings(s) => s.modified = modified,
        }
    }

    /// Serializes the inner entity as an event payload (untagged).
    pub fn to_payload(&self) -> CoreResult<serde_json::Value> {
        let value = match self {
            LibraryEntity::Manga(m) => serde_json::to_value(m),
            LibraryEntity::Chapter(c) => serde_json::to_value(c),
            LibraryEntity::Category(c) => serde_json::to_value(c),
            LibraryEntity::History(h) => serde_json::to_value(h),
            LibraryEntity::Settings(s) => serde_json::to_value(s),
        };

        value.map_err(|e| CoreError::PayloadMismatch {
            entity_type: self.entity_type().to_string(),
            entity_id: self.id().to_string(),
            reason: e.to_string(),
        })
    }

    /// Reads the entity carried by a queued event. A delete event yields a
    /// soft-deleted entity.
    pub fn from_event(event: &SyncEvent) -> CoreResult<Self> {
        let mut entity = Self::from_payload(event.entity_type, &event.entity_id, &event.payload)?;
        if event.is_delete() && !entity.is_deleted() {
            entity.mark_deleted(entity.modified().max(event.timestamp));
        }
        Ok(entity)
    }

    /// Reads an untagged payload back as the given entity type.
    pub fn from_payload(
        entity_type: EntityType,
        entity_id: &str,
        payload: &serde_json::Value,
    ) -> CoreResult<Self> {
        let mismatch = |e: serde_json::Error| CoreError::PayloadMismatch {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            reason: e.to_string(),
        };

        let payload = payload.clone();
        let entity = match entity_type {
            EntityType::Manga => LibraryEntity::Manga(serde_json::from_value(payload).map_err(mismatch)?),
            EntityType::Chapter => {
                LibraryEntity::Chapter(serde_json::from_value(payload).map_err(mismatch)?)
            }
            EntityType::Category => {
                LibraryEntity::Category(serde_json::from_value(payload).map_err(mismatch)?)
            }
            EntityType::History => {
                LibraryEntity::History(serde_json::from_value(payload).map_err(mismatch)?)
            }
            EntityType::Settings => {
                LibraryEntity::Settings(serde_json::from_value(payload).map_err(mismatch)?)
            }
        };

        if entity.id() != entity_id {
            return Err(CoreError::PayloadMismatch {
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                reason: format!("payload id '{}' does not match", entity.id()),
            });
        }

        Ok(entity)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_payload_roundtrip_keeps_entity_type() {
        let entity = LibraryEntity::Chapter(chapter("c1", "m1", 10));
        let payload = entity.to_payload().unwrap();
        assert!(payload.get("entity_type").is_none());

        let back = LibraryEntity::from_payload(EntityType::Chapter, "c1", &payload).unwrap();
        assert_eq!(back, entity);
    }

    #[test]
    fn test_payload_id_mismatch_rejected() {
        let payload = LibraryEntity::Manga(manga("m1", 1)).to_payload().unwrap();
        let err = LibraryEntity::from_payload(EntityType::Manga, "m2", &payload).unwrap_err();
        assert!(matches!(err, CoreError::PayloadMismatch { .. }));
    }

    #[test]
    fn test_payload_wrong_shape_rejected() {
        let payload = serde_json::json!({ "id": "m1" });
        assert!(LibraryEntity::from_payload(EntityType::Manga, "m1", &payload).is_err());
    }

    #[test]
    fn test_mark_deleted() {
        let mut entity = LibraryEntity::Category(Category {
            id: "cat".into(),
            name: "Reading".into(),
            sort_order: 0,
            flags: 0,
            modified: 1,
            deleted: false,
        });
        entity.mark_deleted(50);
        assert!(entity.is_deleted());
        assert_eq!(entity.modified(), 50);
    }
}
