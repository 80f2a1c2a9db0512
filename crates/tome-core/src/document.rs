//! # Remote Documents
//!
//! Shapes of the documents kept in the remote store, and the field-level
//! patches the engine writes into them.
//!
//! ## Remote Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  users/{uid}/                                                           │
//! │  ├── manga/{mangaId}        MangaDocument                               │
//! │  │     title, cover_url, genres, category_ids, ... , modified, deleted  │
//! │  │     chapters: { chapterId: ChapterDocument }   (denormalized)        │
//! │  ├── categories/{id}        CategoryDocument                            │
//! │  ├── history/{id}           HistoryDocument                             │
//! │  └── settings/{id}          SettingsDocument                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Patches
//! Every outbound write is a *merge* write: the patch's fields are deep-merged
//! into the existing document. A chapter event therefore only touches
//! `chapters.<id>` of its manga document, and two devices marking different
//! chapters never overwrite each other. Patches are built against the current
//! remote copy ([`DocumentPatch::merged_up`]) so a stale snapshot cannot
//! regress it.
//!
//! `modified` is the entity's own edit time and drives last-write-wins.
//! `updated_at` is stamped on every patch and is what incremental queries
//! (`modified_after`) filter on, so chapter-only writes are still caught up.
//!
//! Deletes are soft: the document stays with `deleted: true`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::event::{EntityType, SyncEvent};
use crate::library::{
    Category, Chapter, HistoryEntry, LibraryEntity, LibrarySettings, Manga, PublicationStatus,
};
use crate::merge::{
    merge_category_up, merge_chapter_up, merge_history_up, merge_manga_up, merge_settings_up,
};
use crate::validation::validate_entity_id;

// =============================================================================
// Collections
// =============================================================================

/// Remote collections under `users/{uid}/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Manga,
    Categories,
    History,
    Settings,
}

impl Collection {
    /// Every remote collection.
    pub const ALL: [Collection; 4] = [
        Collection::Manga,
        Collection::Categories,
        Collection::History,
        Collection::Settings,
    ];

    /// Path segment name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Manga => "manga",
            Collection::Categories => "categories",
            Collection::History => "history",
            Collection::Settings => "settings",
        }
    }

    /// Collection an entity type is stored in. Chapters live inside manga.
    pub fn for_entity(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Manga | EntityType::Chapter => Collection::Manga,
            EntityType::Category => Collection::Categories,
            EntityType::History => Collection::History,
            EntityType::Settings => Collection::Settings,
        }
    }

    /// `users/{uid}/{collection}`
    pub fn path(&self, user_id: &str) -> String {
        format!("users/{}/{}", user_id, self.as_str())
    }

    /// `users/{uid}/{collection}/{id}`
    pub fn document_path(&self, user_id: &str, document_id: &str) -> String {
        format!("users/{}/{}/{}", user_id, self.as_str(), document_id)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Document Shapes
// =============================================================================

/// Per-chapter state embedded in a manga document.
///
/// Every field has a default: a chapter entry can be created by a
/// progress-only patch before the full chapter was ever uploaded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(default)]
pub struct ChapterDocument {
    pub id: String,
    pub url: String,
    pub name: String,
    pub number: f32,
    pub is_read: bool,
    pub last_page_read: u32,
    pub bookmarked: bool,
    pub date_upload: i64,
    pub modified: i64,
    pub deleted: bool,
}

impl ChapterDocument {
    pub fn from_local(chapter: &Chapter) -> Self {
        Self {
            id: chapter.id.clone(),
            url: chapter.url.clone(),
            name: chapter.name.clone(),
            number: chapter.number,
            is_read: chapter.is_read,
            last_page_read: chapter.last_page_read,
            bookmarked: chapter.bookmarked,
            date_upload: chapter.date_upload,
            modified: chapter.modified,
            deleted: chapter.deleted,
        }
    }

    pub fn to_local(&self, manga_id: &str) -> Chapter {
        Chapter {
            id: self.id.clone(),
            manga_id: manga_id.to_string(),
            url: self.url.clone(),
            name: self.name.clone(),
            number: self.number,
            is_read: self.is_read,
            last_page_read: self.last_page_read,
            bookmarked: self.bookmarked,
            date_upload: self.date_upload,
            modified: self.modified,
            deleted: self.deleted,
        }
    }
}

/// `users/{uid}/manga/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MangaDocument {
    /// Filled from the document path when absent.
    #[serde(default)]
    pub id: String,

    #[serde(default)]
    pub source: String,

    #[serde(default)]
    pub url: String,

    /// Empty when only chapter entries were ever written.
    #[serde(default)]
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

    #[serde(default)]
    pub genres: Vec<String>,

    #[serde(default)]
    pub category_ids: Vec<String>,

    #[serde(default)]
    pub favorite: bool,

    #[serde(default)]
    pub date_added: i64,

    /// Edit time of the manga's own fields (LWW input).
    #[serde(default)]
    pub modified: i64,

    #[serde(default)]
    pub deleted: bool,

    /// Time of the last patch of any kind, chapters included.
    #[serde(default)]
    pub updated_at: i64,

    /// Embedded chapters keyed by chapter id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chapters: BTreeMap<String, ChapterDocument>,
}

impl MangaDocument {
    /// Builds a document from local state. Chapters of other manga are ignored.
    pub fn from_local(manga: &Manga, chapters: &[Chapter]) -> Self {
        Self {
            id: manga.id.clone(),
            source: manga.source.clone(),
            url: manga.url.clone(),
            title: manga.title.clone(),
            author: manga.author.clone(),
            artist: manga.artist.clone(),
            description: manga.description.clone(),
            cover_url: manga.cover_url.clone(),
            status: manga.status,
            genres: manga.genres.clone(),
            category_ids: manga.category_ids.clone(),
            favorite: manga.favorite,
            date_added: manga.date_added,
            modified: manga.modified,
            deleted: manga.deleted,
            updated_at: manga.modified,
            chapters: chapters
                .iter()
                .filter(|c| c.manga_id == manga.id)
                .map(|c| (c.id.clone(), ChapterDocument::from_local(c)))
                .collect(),
        }
    }

    /// True for a document holding chapter entries but no manga fields yet.
    pub fn is_stub(&self) -> bool {
        self.title.is_empty() && self.modified == 0
    }

    /// Splits the document into the local manga and its chapters.
    pub fn to_local(&self) -> (Manga, Vec<Chapter>) {
        let manga = Manga {
            id: self.id.clone(),
            source: self.source.clone(),
            url: self.url.clone(),
            title: self.title.clone(),
            author: self.author.clone(),
            artist: self.artist.clone(),
            description: self.description.clone(),
            cover_url: self.cover_url.clone(),
            status: self.status,
            genres: self.genres.clone(),
            category_ids: self.category_ids.clone(),
            favorite: self.favorite,
            date_added: self.date_added,
            modified: self.modified,
            deleted: self.deleted,
        };
        let chapters = self.chapters.values().map(|c| c.to_local(&self.id)).collect();
        (manga, chapters)
    }
}

/// `users/{uid}/categories/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CategoryDocument {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sort_order: i32,
    #[serde(default)]
    pub flags: i64,
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub updated_at: i64,
}

impl CategoryDocument {
    pub fn from_local(category: &Category) -> Self {
        Self {
            id: category.id.clone(),
            name: category.name.clone(),
            sort_order: category.sort_order,
            flags: category.flags,
            modified: category.modified,
            deleted: category.deleted,
            updated_at: category.modified,
        }
    }

    pub fn to_local(&self) -> Category {
        Category {
            id: self.id.clone(),
            name: self.name.clone(),
            sort_order: self.sort_order,
            flags: self.flags,
            modified: self.modified,
            deleted: self.deleted,
        }
    }
}

/// `users/{uid}/history/{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HistoryDocument {
    #[serde(default)]
    pub id: String,
    pub manga_id: String,
    pub chapter_id: String,
    pub last_read: i64,
    #[serde(default)]
    pub time_read_ms: i64,
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub updated_at: i64,
}

impl HistoryDocument {
    pub fn from_local(entry: &HistoryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            manga_id: entry.manga_id.clone(),
            chapter_id: entry.chapter_id.clone(),
            last_read: entry.last_read,
            time_read_ms: entry.time_read_ms,
            modified: entry.modified,
            deleted: entry.deleted,
            updated_at: entry.modified,
        }
    }

    pub fn to_local(&self) -> HistoryEntry {
        HistoryEntry {
            id: self.id.clone(),
            manga_id: self.manga_id.clone(),
            chapter_id: self.chapter_id.clone(),
            last_read: self.last_read,
            time_read_ms: self.time_read_ms,
            modified: self.modified,
            deleted: self.deleted,
        }
    }
}

/// `users/{uid}/settings/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SettingsDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl SettingsDocument {
    pub fn from_local(settings: &LibrarySettings) -> Self {
        Self {
            id: settings.id.clone(),
            values: settings.values.clone(),
            modified: settings.modified,
            updated_at: settings.modified,
        }
    }

    pub fn to_local(&self) -> LibrarySettings {
        LibrarySettings {
            id: self.id.clone(),
            values: self.values.clone(),
            modified: self.modified,
        }
    }
}

// =============================================================================
// Decoded Remote Document
// =============================================================================

/// A validated document read from one of the remote collections.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteDocument {
    Manga(MangaDocument),
    Category(CategoryDocument),
    History(HistoryDocument),
    Settings(SettingsDocument),
}

impl RemoteDocument {
    /// Decodes and validates raw document data.
    ///
    /// ## Errors
    /// [`CoreError::MalformedDocument`] when the JSON does not fit the
    /// collection's shape, the document id is not a valid path segment, or an
    /// embedded id disagrees with the id it is stored under.
    pub fn decode(collection: Collection, id: &str, data: &serde_json::Value) -> CoreResult<Self> {
        let malformed = |reason: String| CoreError::malformed(collection.as_str(), id, reason);

        validate_entity_id("document_id", id).map_err(|e| malformed(e.to_string()))?;

        let doc = match collection {
            Collection::Manga => {
                let mut doc: MangaDocument =
                    serde_json::from_value(data.clone()).map_err(|e| malformed(e.to_string()))?;
                adopt_id(&mut doc.id, id).map_err(malformed)?;
                for (key, chapter) in doc.chapters.iter_mut() {
                    validate_entity_id("chapter_id", key).map_err(|e| malformed(e.to_string()))?;
                    adopt_id(&mut chapter.id, key).map_err(malformed)?;
                }
                RemoteDocument::Manga(doc)
            }
            Collection::Categories => {
                let mut doc: CategoryDocument =
                    serde_json::from_value(data.clone()).map_err(|e| malformed(e.to_string()))?;
                adopt_id(&mut doc.id, id).map_err(malformed)?;
                RemoteDocument::Category(doc)
            }
            Collection::History => {
                let mut doc: HistoryDocument =
                    serde_json::from_value(data.clone()).map_err(|e| malformed(e.to_string()))?;
                adopt_id(&mut doc.id, id).map_err(malformed)?;
                RemoteDocument::History(doc)
            }
            Collection::Settings => {
                let mut doc: SettingsDocument =
                    serde_json::from_value(data.clone()).map_err(|e| malformed(e.to_string()))?;
                adopt_id(&mut doc.id, id).map_err(malformed)?;
                RemoteDocument::Settings(doc)
            }
        };

        Ok(doc)
    }

    pub fn collection(&self) -> Collection {
        match self {
            RemoteDocument::Manga(_) => Collection::Manga,
            RemoteDocument::Category(_) => Collection::Categories,
            RemoteDocument::History(_) => Collection::History,
            RemoteDocument::Settings(_) => Collection::Settings,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RemoteDocument::Manga(d) => &d.id,
            RemoteDocument::Category(d) => &d.id,
            RemoteDocument::History(d) => &d.id,
            RemoteDocument::Settings(d) => &d.id,
        }
    }

    pub fn modified(&self) -> i64 {
        match self {
            RemoteDocument::Manga(d) => d.modified,
            RemoteDocument::Category(d) => d.modified,
            RemoteDocument::History(d) => d.modified,
            RemoteDocument::Settings(d) => d.modified,
        }
    }

    /// Patch time, used for echo suppression and incremental queries.
    pub fn updated_at(&self) -> i64 {
        match self {
            RemoteDocument::Manga(d) => d.updated_at,
            RemoteDocument::Category(d) => d.updated_at,
            RemoteDocument::History(d) => d.updated_at,
            RemoteDocument::Settings(d) => d.updated_at,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            RemoteDocument::Manga(d) => d.deleted,
            RemoteDocument::Category(d) => d.deleted,
            RemoteDocument::History(d) => d.deleted,
            RemoteDocument::Settings(_) => false,
        }
    }
}

/// Fills an empty embedded id from its key, or rejects a mismatch.
fn adopt_id(embedded: &mut String, key: &str) -> Result<(), String> {
    if embedded.is_empty() {
        *embedded = key.to_string();
        Ok(())
    } else if embedded != key {
        Err(format!("embedded id '{}' does not match '{}'", embedded, key))
    } else {
        Ok(())
    }
}

// =============================================================================
// Document Patch
// =============================================================================

/// A field-level merge write into one remote document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPatch {
    pub collection: Collection,
    pub document_id: String,
    /// JSON object deep-merged into the document.
    pub fields: serde_json::Value,
    /// Value stamped into `updated_at`.
    pub updated_at: i64,
}

impl DocumentPatch {
    /// Converts a queued event into the patch that carries it, written blind.
    ///
    /// ## Errors
    /// [`CoreError::PayloadMismatch`] when the payload cannot be read as the
    /// event's entity type. The event can never be written and is a permanent
    /// failure.
    pub fn from_event(event: &SyncEvent, updated_at: i64) -> CoreResult<Self> {
        Self::from_entity(&LibraryEntity::from_event(event)?, updated_at)
    }

    /// Builds the patch for a local entity snapshot, written blind.
    pub fn from_entity(entity: &LibraryEntity, updated_at: i64) -> CoreResult<Self> {
        Self::merged_up(entity, None, updated_at)
    }

    /// Builds the patch for a local entity merged against the current remote
    /// document it lands in.
    ///
    /// For a chapter, `remote` is the owning manga document. A remote document
    /// of the wrong collection is ignored.
    pub fn merged_up(
        entity: &LibraryEntity,
        remote: Option<&RemoteDocument>,
        updated_at: i64,
    ) -> CoreResult<Self> {
        let to_value = |value: Result<serde_json::Value, serde_json::Error>| {
            value.map_err(|e| CoreError::PayloadMismatch {
                entity_type: entity.entity_type().to_string(),
                entity_id: entity.id().to_string(),
                reason: e.to_string(),
            })
        };

        let (collection, document_id, mut fields) = match entity {
            LibraryEntity::Manga(manga) => {
                let remote = match remote {
                    Some(RemoteDocument::Manga(doc)) => Some(doc),
                    _ => None,
                };
                // No chapters: a manga patch must not touch chapter entries.
                let mut doc = merge_manga_up(manga, &[], remote);
                doc.chapters.clear();
                (Collection::Manga, manga.id.clone(), to_value(serde_json::to_value(doc))?)
            }
            LibraryEntity::Chapter(chapter) => {
                let remote = match remote {
                    Some(RemoteDocument::Manga(doc)) => doc.chapters.get(&chapter.id),
                    _ => None,
                };
                let doc = merge_chapter_up(chapter, remote);
                let mut chapters = serde_json::Map::new();
                chapters.insert(chapter.id.clone(), to_value(serde_json::to_value(doc))?);
                let fields = serde_json::json!({ "chapters": chapters });
                (Collection::Manga, chapter.manga_id.clone(), fields)
            }
            LibraryEntity::Category(category) => {
                let remote = match remote {
                    Some(RemoteDocument::Category(doc)) => Some(doc),
                    _ => None,
                };
                let doc = merge_category_up(category, remote);
                (Collection::Categories, category.id.clone(), to_value(serde_json::to_value(doc))?)
            }
            LibraryEntity::History(entry) => {
                let remote = match remote {
                    Some(RemoteDocument::History(doc)) => Some(doc),
                    _ => None,
                };
                let doc = merge_history_up(entry, remote);
                (Collection::History, entry.id.clone(), to_value(serde_json::to_value(doc))?)
            }
            LibraryEntity::Settings(settings) => {
                let remote = match remote {
                    Some(RemoteDocument::Settings(doc)) => Some(doc),
                    _ => None,
                };
                let doc = merge_settings_up(settings, remote);
                (Collection::Settings, settings.id.clone(), to_value(serde_json::to_value(doc))?)
            }
        };

        validate_entity_id("document_id", &document_id)?;

        if let Some(obj) = fields.as_object_mut() {
            obj.insert("updated_at".to_string(), serde_json::Value::from(updated_at));
        }

        Ok(Self {
            collection,
            document_id,
            fields,
            updated_at,
        })
    }

    /// Full document path for a user.
    pub fn path(&self, user_id: &str) -> String {
        self.collection.document_path(user_id, &self.document_id)
    }
}

/// Deep-merges `patch` into `target`. Objects merge key by key; every other
/// value (arrays included) replaces.
pub fn deep_merge(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::library::fixtures::{chapter, manga};

    #[test]
    fn test_paths() {
        assert_eq!(Collection::Manga.path("u1"), "users/u1/manga");
        assert_eq!(
            Collection::Categories.document_path("u1", "c9"),
            "users/u1/categories/c9"
        );
        assert_eq!(Collection::for_entity(EntityType::Chapter), Collection::Manga);
    }

    #[test]
    fn test_decode_fills_missing_ids() {
        let data = serde_json::json!({
            "title": "Berserk",
            "modified": 5,
            "chapters": { "c1": { "is_read": true } }
        });
        let doc = RemoteDocument::decode(Collection::Manga, "m1", &data).unwrap();
        let RemoteDocument::Manga(doc) = doc else {
            panic!("expected manga");
        };
        assert_eq!(doc.id, "m1");
        assert_eq!(doc.chapters["c1"].id, "c1");
        assert!(doc.chapters["c1"].is_read);
    }

    #[test]
    fn test_decode_rejects_mismatched_id() {
        let data = serde_json::json!({ "id": "other", "name": "Reading" });
        let err = RemoteDocument::decode(Collection::Categories, "cat1", &data).unwrap_err();
        assert!(matches!(err, CoreError::MalformedDocument { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_required_field() {
        let data = serde_json::json!({ "manga_id": "m1", "chapter_id": "c1" });
        assert!(RemoteDocument::decode(Collection::History, "h1", &data).is_err());
    }

    #[test]
    fn test_decode_chapter_only_document() {
        let data = serde_json::json!({
            "updated_at": 40,
            "chapters": { "c1": { "is_read": true, "last_page_read": 6 } }
        });
        let RemoteDocument::Manga(doc) =
            RemoteDocument::decode(Collection::Manga, "m1", &data).unwrap()
        else {
            panic!("expected manga");
        };
        assert!(doc.is_stub());
        assert_eq!(doc.chapters["c1"].last_page_read, 6);
    }

    #[test]
    fn test_merged_patch_keeps_remote_state() {
        let mut remote = MangaDocument::from_local(&manga("m1", 500), &[]);
        remote.title = "Remote".into();
        remote.deleted = true;
        let mut entry = ChapterDocument::from_local(&chapter("c1", "m1", 50));
        entry.is_read = true;
        entry.last_page_read = 20;
        remote.chapters.insert("c1".into(), entry);
        let remote = RemoteDocument::Manga(remote);

        let mut stale = chapter("c1", "m1", 100);
        stale.last_page_read = 4;
        let patch =
            DocumentPatch::merged_up(&LibraryEntity::Chapter(stale), Some(&remote), 900).unwrap();
        assert_eq!(patch.fields["chapters"]["c1"]["is_read"], true);
        assert_eq!(patch.fields["chapters"]["c1"]["last_page_read"], 20);

        let patch =
            DocumentPatch::merged_up(&LibraryEntity::Manga(manga("m1", 100)), Some(&remote), 900)
                .unwrap();
        assert_eq!(patch.fields["deleted"], true);
        assert_eq!(patch.fields["modified"], 500);
        assert_eq!(patch.fields["title"], "Remote");
        assert!(patch.fields.get("chapters").is_none());
        assert_eq!(patch.fields["updated_at"], 900);
    }

    #[test]
    fn test_chapter_patch_targets_manga_document() {
        let mut ch = chapter("c7", "m1", 100);
        ch.is_read = true;
        let payload = LibraryEntity::Chapter(ch).to_payload().unwrap();
        let event = SyncEvent::new(EntityType::Chapter, "c7", EventKind::Update, payload, 100, 1);

        let patch = DocumentPatch::from_event(&event, event.timestamp).unwrap();
        assert_eq!(patch.collection, Collection::Manga);
        assert_eq!(patch.document_id, "m1");
        assert_eq!(patch.fields["chapters"]["c7"]["is_read"], true);
        assert!(patch.fields.get("title").is_none());
        assert_eq!(patch.fields["updated_at"], 100);
    }

    #[test]
    fn test_manga_patch_leaves_chapters_alone() {
        let payload = LibraryEntity::Manga(manga("m1", 3)).to_payload().unwrap();
        let event = SyncEvent::new(EntityType::Manga, "m1", EventKind::Update, payload, 3, 1);
        let patch = DocumentPatch::from_event(&event, event.timestamp).unwrap();
        assert!(patch.fields.get("chapters").is_none());
        assert_eq!(patch.fields["title"], "Manga m1");
    }

    #[test]
    fn test_delete_patch_is_soft() {
        let payload = LibraryEntity::Manga(manga("m1", 3)).to_payload().unwrap();
        let event = SyncEvent::new(EntityType::Manga, "m1", EventKind::Delete, payload, 9, 1);
        let patch = DocumentPatch::from_event(&event, event.timestamp).unwrap();
        assert_eq!(patch.fields["deleted"], true);
        assert_eq!(patch.fields["modified"], 9);
    }

    #[test]
    fn test_unreadable_payload_is_error() {
        let event = SyncEvent::new(
            EntityType::Chapter,
            "c1",
            EventKind::Update,
            serde_json::json!({ "nope": 1 }),
            1,
            1,
        );
        assert!(DocumentPatch::from_event(&event, 1).is_err());
    }

    #[test]
    fn test_deep_merge_keeps_sibling_chapters() {
        let mut doc = serde_json::json!({
            "title": "A",
            "genres": ["x", "y"],
            "chapters": { "c1": { "is_read": true } }
        });
        deep_merge(
            &mut doc,
            &serde_json::json!({ "genres": ["z"], "chapters": { "c2": { "is_read": true } } }),
        );
        assert_eq!(doc["chapters"]["c1"]["is_read"], true);
        assert_eq!(doc["chapters"]["c2"]["is_read"], true);
        assert_eq!(doc["genres"], serde_json::json!(["z"]));
    }
}
