//! # Conflict Resolution
//!
//! Pure merge rules between local entities and remote documents.
//!
//! ## Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Field-Level Merge Laws                           │
//! │                                                                         │
//! │  Field                         Rule                Timestamp-driven?    │
//! │  ───────────────────────────   ─────────────────   ──────────────────   │
//! │  title, cover, status, ...     last-write-wins     yes (ties → local)   │
//! │  genres, category_ids          replace wholesale   yes (remote newer)   │
//! │  chapter.is_read               OR                  no                   │
//! │  chapter.last_page_read        MAX                 no                   │
//! │  history.last_read, time_read  MAX                 no                   │
//! │  deleted (remote)              wins, hide local    no                   │
//! │  deleted (local)               stays deleted       no                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The OR/MAX laws are commutative, associative and idempotent, so reading
//! progress converges regardless of the order in which devices sync and is
//! never lost. Everything else is last-write-wins on `modified`.
//!
//! Direction naming:
//! - `*_down`: remote document → local entity (inbound)
//! - `*_up`: local entity → remote document (flush and full upload)
//!
//! Every `*_up` rule is applied against the current remote copy before a
//! write, so a stale local snapshot can never clear `deleted`, lower
//! `modified` or drop reading progress on the remote.

use std::collections::HashMap;

use crate::document::{
    CategoryDocument, ChapterDocument, HistoryDocument, MangaDocument, SettingsDocument,
};
use crate::library::{Category, Chapter, ChapterProgress, HistoryEntry, LibrarySettings, Manga};

// =============================================================================
// Outcome
// =============================================================================

/// Result of merging one remote document into local state.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome<T> {
    /// Local state already reflects the remote document.
    Unchanged,
    /// Local entity must be overwritten with this value.
    Updated(T),
    /// Entity is new locally.
    Created(T),
    /// Remote soft-deleted the entity; hide it locally.
    Hidden { id: String },
}

impl<T> MergeOutcome<T> {
    /// Returns true if a local write is required.
    pub fn is_change(&self) -> bool {
        !matches!(self, MergeOutcome::Unchanged)
    }
}

/// Merge result for a manga document and its embedded chapters.
#[derive(Debug, Clone, PartialEq)]
pub struct MangaMerge {
    pub manga: MergeOutcome<Manga>,
    pub chapters: Vec<MergeOutcome<Chapter>>,
}

impl MangaMerge {
    fn unchanged() -> Self {
        Self {
            manga: MergeOutcome::Unchanged,
            chapters: Vec::new(),
        }
    }

    /// Number of local writes this merge produces.
    pub fn change_count(&self) -> usize {
        usize::from(self.manga.is_change()) + self.chapters.iter().filter(|c| c.is_change()).count()
    }
}

// =============================================================================
// Monotonic Laws
// =============================================================================

/// Merges two reading states: `is_read` is OR-ed, `last_page_read` MAX-ed.
#[inline]
pub fn merge_progress(a: ChapterProgress, b: ChapterProgress) -> ChapterProgress {
    ChapterProgress {
        is_read: a.is_read || b.is_read,
        last_page_read: a.last_page_read.max(b.last_page_read),
    }
}

/// Returns true when `remote_modified` beats `local_modified`. Ties keep local.
#[inline]
fn remote_wins(local_modified: i64, remote_modified: i64) -> bool {
    remote_modified > local_modified
}

/// Shared handling of soft-delete and absence before field merging.
///
/// Returns `Some(outcome)` when the decision is already made.
fn settle_presence<T>(
    local: Option<(&str, bool)>,
    remote_deleted: bool,
    create: impl FnOnce() -> T,
) -> Option<MergeOutcome<T>> {
    match local {
        None if remote_deleted => Some(MergeOutcome::Unchanged),
        None => Some(MergeOutcome::Created(create())),
        Some((_, true)) => Some(MergeOutcome::Unchanged),
        Some((id, false)) if remote_deleted => Some(MergeOutcome::Hidden { id: id.to_string() }),
        Some(_) => None,
    }
}

fn outcome_of<T: PartialEq>(original: &T, merged: T) -> MergeOutcome<T> {
    if &merged == original {
        MergeOutcome::Unchanged
    } else {
        MergeOutcome::Updated(merged)
    }
}

// =============================================================================
// Down: remote → local
// =============================================================================

/// Merges a remote chapter entry into the local chapter.
pub fn merge_chapter(
    local: Option<&Chapter>,
    remote: &ChapterDocument,
    manga_id: &str,
) -> MergeOutcome<Chapter> {
    if let Some(decided) = settle_presence(
        local.map(|c| (c.id.as_str(), c.deleted)),
        remote.deleted,
        || remote.to_local(manga_id),
    ) {
        return decided;
    }
    let Some(local) = local else {
        return MergeOutcome::Unchanged;
    };

    let mut merged = local.clone();
    if remote_wins(local.modified, remote.modified) {
        merged.url = remote.url.clone();
        merged.name = remote.name.clone();
        merged.number = remote.number;
        merged.bookmarked = remote.bookmarked;
        merged.date_upload = remote.date_upload;
        merged.modified = remote.modified;
    }
    merged.set_progress(merge_progress(
        local.progress(),
        ChapterProgress {
            is_read: remote.is_read,
            last_page_read: remote.last_page_read,
        },
    ));

    outcome_of(local, merged)
}

/// Merges a remote manga document (with its chapters) into local state.
pub fn merge_manga_down(
    local: Option<&Manga>,
    local_chapters: &[Chapter],
    remote: &MangaDocument,
) -> MangaMerge {
    let by_id: HashMap<&str, &Chapter> = local_chapters
        .iter()
        .filter(|c| c.manga_id == remote.id)
        .map(|c| (c.id.as_str(), c))
        .collect();

    let chapters_of = |skip_deleted: bool| -> Vec<MergeOutcome<Chapter>> {
        remote
            .chapters
            .values()
            .filter(|c| !(skip_deleted && c.deleted))
            .map(|c| merge_chapter(by_id.get(c.id.as_str()).copied(), c, &remote.id))
            .filter(MergeOutcome::is_change)
            .collect()
    };

    match local {
        None if remote.deleted || remote.is_stub() => MangaMerge::unchanged(),
        None => {
            let (manga, _) = remote.to_local();
            MangaMerge {
                manga: MergeOutcome::Created(manga),
                chapters: chapters_of(true),
            }
        }
        Some(local) if local.deleted => MangaMerge::unchanged(),
        Some(local) if remote.deleted => MangaMerge {
            manga: MergeOutcome::Hidden {
                id: local.id.clone(),
            },
            chapters: Vec::new(),
        },
        Some(local) => {
            let mut merged = local.clone();
            if remote_wins(local.modified, remote.modified) {
                merged.source = remote.source.clone();
                merged.url = remote.url.clone();
                merged.title = remote.title.clone();
                merged.author = remote.author.clone();
                merged.artist = remote.artist.clone();
                merged.description = remote.description.clone();
                merged.cover_url = remote.cover_url.clone();
                merged.status = remote.status;
                merged.favorite = remote.favorite;
                merged.genres = remote.genres.clone();
                merged.category_ids = remote.category_ids.clone();
                merged.modified = remote.modified;
            }
            MangaMerge {
                manga: outcome_of(local, merged),
                chapters: chapters_of(false),
            }
        }
    }
}

/// Merges a remote category. Last-write-wins.
pub fn merge_category(local: Option<&Category>, remote: &CategoryDocument) -> MergeOutcome<Category> {
    if let Some(decided) = settle_presence(
        local.map(|c| (c.id.as_str(), c.deleted)),
        remote.deleted,
        || remote.to_local(),
    ) {
        return decided;
    }
    let Some(local) = local else {
        return MergeOutcome::Unchanged;
    };

    if remote_wins(local.modified, remote.modified) {
        outcome_of(local, remote.to_local())
    } else {
        MergeOutcome::Unchanged
    }
}

/// Merges a remote history entry. Read time and accumulated time are MAX-ed.
pub fn merge_history(
    local: Option<&HistoryEntry>,
    remote: &HistoryDocument,
) -> MergeOutcome<HistoryEntry> {
    if let Some(decided) = settle_presence(
        local.map(|h| (h.id.as_str(), h.deleted)),
        remote.deleted,
        || remote.to_local(),
    ) {
        return decided;
    }
    let Some(local) = local else {
        return MergeOutcome::Unchanged;
    };

    let mut merged = local.clone();
    if remote_wins(local.modified, remote.modified) {
        merged.manga_id = remote.manga_id.clone();
        merged.chapter_id = remote.chapter_id.clone();
        merged.modified = remote.modified;
    }
    merged.last_read = local.last_read.max(remote.last_read);
    merged.time_read_ms = local.time_read_ms.max(remote.time_read_ms);

    outcome_of(local, merged)
}

/// Merges the remote settings document. Last-write-wins on the whole map.
pub fn merge_settings(
    local: Option<&LibrarySettings>,
    remote: &SettingsDocument,
) -> MergeOutcome<LibrarySettings> {
    match local {
        None => MergeOutcome::Created(remote.to_local()),
        Some(local) if remote_wins(local.modified, remote.modified) => {
            outcome_of(local, remote.to_local())
        }
        Some(_) => MergeOutcome::Unchanged,
    }
}

// =============================================================================
// Up: local → remote
// =============================================================================

/// Applies the remote copy of one chapter entry onto the outgoing one.
///
/// Remote-newer metadata is kept, progress is OR/MAX merged and a deletion on
/// either side stays deleted.
fn merge_chapter_entry_up(outgoing: &mut ChapterDocument, remote: &ChapterDocument) {
    let local_progress = ChapterProgress {
        is_read: outgoing.is_read,
        last_page_read: outgoing.last_page_read,
    };
    let local_deleted = outgoing.deleted;
    if remote_wins(outgoing.modified, remote.modified) {
        *outgoing = remote.clone();
    }

    let merged = merge_progress(
        local_progress,
        ChapterProgress {
            is_read: remote.is_read,
            last_page_read: remote.last_page_read,
        },
    );
    outgoing.is_read = merged.is_read;
    outgoing.last_page_read = merged.last_page_read;
    outgoing.deleted = local_deleted || remote.deleted;
}

/// Builds the chapter entry to write from a local chapter.
pub fn merge_chapter_up(local: &Chapter, remote: Option<&ChapterDocument>) -> ChapterDocument {
    let mut doc = ChapterDocument::from_local(local);
    if let Some(remote) = remote {
        merge_chapter_entry_up(&mut doc, remote);
    }
    doc
}

/// Builds the manga document to upload from local state.
///
/// When the current remote document is known, the same laws apply in the
/// other direction: remote-newer scalars are kept, chapter progress is OR/MAX
/// merged, chapters only known remotely are kept, and a deletion on either
/// side stays deleted. An upload therefore never regresses remote progress.
pub fn merge_manga_up(
    local: &Manga,
    local_chapters: &[Chapter],
    remote: Option<&MangaDocument>,
) -> MangaDocument {
    let mut doc = MangaDocument::from_local(local, local_chapters);
    let Some(remote) = remote else {
        return doc;
    };

    if remote_wins(local.modified, remote.modified) {
        let updated_at = doc.updated_at;
        let chapters = std::mem::take(&mut doc.chapters);
        doc = remote.clone();
        doc.chapters = chapters;
        doc.updated_at = updated_at.max(remote.updated_at);
    }
    doc.deleted = local.deleted || remote.deleted;

    for (id, remote_chapter) in &remote.chapters {
        match doc.chapters.get_mut(id) {
            Some(chapter) => merge_chapter_entry_up(chapter, remote_chapter),
            None => {
                doc.chapters.insert(id.clone(), remote_chapter.clone());
            }
        }
    }

    doc
}

/// Builds the category document to write. Last-write-wins, deletion sticks.
pub fn merge_category_up(local: &Category, remote: Option<&CategoryDocument>) -> CategoryDocument {
    let mut doc = CategoryDocument::from_local(local);
    let Some(remote) = remote else {
        return doc;
    };

    if remote_wins(local.modified, remote.modified) {
        doc = remote.clone();
    }
    doc.deleted = local.deleted || remote.deleted;
    doc
}

/// Builds the history document to write. Read times are MAX-ed.
pub fn merge_history_up(local: &HistoryEntry, remote: Option<&HistoryDocument>) -> HistoryDocument {
    let mut doc = HistoryDocument::from_local(local);
    let Some(remote) = remote else {
        return doc;
    };

    if remote_wins(local.modified, remote.modified) {
        doc.manga_id = remote.manga_id.clone();
        doc.chapter_id = remote.chapter_id.clone();
        doc.modified = remote.modified;
    }
    doc.last_read = local.last_read.max(remote.last_read);
    doc.time_read_ms = local.time_read_ms.max(remote.time_read_ms);
    doc.deleted = local.deleted || remote.deleted;
    doc
}

/// Builds the settings document to write. A newer remote map is kept whole.
pub fn merge_settings_up(
    local: &LibrarySettings,
    remote: Option<&SettingsDocument>,
) -> SettingsDocument {
    match remote {
        Some(remote) if remote_wins(local.modified, remote.modified) => remote.clone(),
        _ => SettingsDocument::from_local(local),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::fixtures::{chapter, manga};

    fn progress(is_read: bool, last_page_read: u32) -> ChapterProgress {
        ChapterProgress {
            is_read,
            last_page_read,
        }
    }

    fn remote_chapter(id: &str, is_read: bool, page: u32, modified: i64) -> ChapterDocument {
        ChapterDocument {
            id: id.to_string(),
            name: format!("Chapter {}", id),
            is_read,
            last_page_read: page,
            modified,
            ..Default::default()
        }
    }

    // -------------------------------------------------------------------------
    // Monotonic laws
    // -------------------------------------------------------------------------

    #[test]
    fn test_progress_or_max() {
        let merged = merge_progress(progress(false, 5), progress(true, 3));
        assert_eq!(merged, progress(true, 5));
    }

    #[test]
    fn test_progress_laws_hold_for_all_orders() {
        let samples = [
            progress(false, 0),
            progress(false, 7),
            progress(true, 2),
            progress(true, 12),
        ];
        for a in samples {
            assert_eq!(merge_progress(a, a), a);
            for b in samples {
                assert_eq!(merge_progress(a, b), merge_progress(b, a));
                for c in samples {
                    assert_eq!(
                        merge_progress(merge_progress(a, b), c),
                        merge_progress(a, merge_progress(b, c))
                    );
                }
            }
        }
    }

    #[test]
    fn test_chapter_progress_ignores_timestamps() {
        let mut local = chapter("c1", "m1", 500);
        local.last_page_read = 5;
        let remote = remote_chapter("c1", true, 3, 100);

        let MergeOutcome::Updated(merged) = merge_chapter(Some(&local), &remote, "m1") else {
            panic!("expected update");
        };
        assert!(merged.is_read);
        assert_eq!(merged.last_page_read, 5);
        assert_eq!(merged.modified, 500);
    }

    #[test]
    fn test_chapter_merges_commute() {
        let base = chapter("c1", "m1", 1);
        let a = remote_chapter("c1", true, 2, 10);
        let b = remote_chapter("c1", false, 9, 20);

        let apply = |ch: &Chapter, doc: &ChapterDocument| match merge_chapter(Some(ch), doc, "m1") {
            MergeOutcome::Updated(c) => c,
            _ => ch.clone(),
        };

        let ab = apply(&apply(&base, &a), &b);
        let ba = apply(&apply(&base, &b), &a);
        assert_eq!(ab.progress(), ba.progress());
        assert_eq!(ab.progress(), progress(true, 9));
    }

    // -------------------------------------------------------------------------
    // Last-write-wins
    // -------------------------------------------------------------------------

    #[test]
    fn test_manga_scalar_lww() {
        let local = manga("m1", 100);
        let mut remote = MangaDocument::from_local(&local, &[]);
        remote.title = "Renamed".into();
        remote.genres = vec!["Drama".into()];
        remote.modified = 200;

        let result = merge_manga_down(Some(&local), &[], &remote);
        let MergeOutcome::Updated(merged) = result.manga else {
            panic!("expected update");
        };
        assert_eq!(merged.title, "Renamed");
        assert_eq!(merged.genres, vec!["Drama".to_string()]);
    }

    #[test]
    fn test_manga_tie_keeps_local() {
        let local = manga("m1", 100);
        let mut remote = MangaDocument::from_local(&local, &[]);
        remote.title = "Other".into();

        let result = merge_manga_down(Some(&local), &[], &remote);
        assert_eq!(result.manga, MergeOutcome::Unchanged);
    }

    #[test]
    fn test_manga_older_remote_keeps_local_but_merges_chapters() {
        let local = manga("m1", 300);
        let local_ch = chapter("c1", "m1", 300);
        let mut remote = MangaDocument::from_local(&manga("m1", 100), &[]);
        remote.title = "Stale".into();
        remote
            .chapters
            .insert("c1".into(), remote_chapter("c1", true, 0, 50));

        let result = merge_manga_down(Some(&local), &[local_ch], &remote);
        assert_eq!(result.manga, MergeOutcome::Unchanged);
        assert_eq!(result.chapters.len(), 1);
        let MergeOutcome::Updated(ch) = &result.chapters[0] else {
            panic!("expected chapter update");
        };
        assert!(ch.is_read);
    }

    #[test]
    fn test_new_manga_created_with_chapters() {
        let mut remote = MangaDocument::from_local(&manga("m9", 10), &[]);
        remote
            .chapters
            .insert("c1".into(), remote_chapter("c1", true, 4, 10));
        let mut gone = remote_chapter("c2", false, 0, 10);
        gone.deleted = true;
        remote.chapters.insert("c2".into(), gone);

        let result = merge_manga_down(None, &[], &remote);
        assert!(matches!(result.manga, MergeOutcome::Created(_)));
        assert_eq!(result.chapters.len(), 1);
        let MergeOutcome::Created(ch) = &result.chapters[0] else {
            panic!("expected created chapter");
        };
        assert_eq!(ch.manga_id, "m9");
    }

    #[test]
    fn test_settings_lww() {
        let local = LibrarySettings {
            id: "preferences".into(),
            values: [("theme".to_string(), serde_json::json!("dark"))].into(),
            modified: 10,
        };
        let mut remote = SettingsDocument::from_local(&local);
        remote.values.insert("theme".into(), serde_json::json!("light"));

        assert_eq!(merge_settings(Some(&local), &remote), MergeOutcome::Unchanged);

        remote.modified = 11;
        assert!(matches!(
            merge_settings(Some(&local), &remote),
            MergeOutcome::Updated(_)
        ));
    }

    #[test]
    fn test_history_takes_max() {
        let local = HistoryEntry {
            id: "h1".into(),
            manga_id: "m1".into(),
            chapter_id: "c1".into(),
            last_read: 1_000,
            time_read_ms: 50,
            modified: 1_000,
            deleted: false,
        };
        let mut remote = HistoryDocument::from_local(&local);
        remote.last_read = 900;
        remote.time_read_ms = 80;

        let MergeOutcome::Updated(merged) = merge_history(Some(&local), &remote) else {
            panic!("expected update");
        };
        assert_eq!(merged.last_read, 1_000);
        assert_eq!(merged.time_read_ms, 80);
    }

    // -------------------------------------------------------------------------
    // Deletion
    // -------------------------------------------------------------------------

    #[test]
    fn test_remote_delete_hides_local() {
        let local = Category {
            id: "cat".into(),
            name: "Reading".into(),
            sort_order: 0,
            flags: 0,
            modified: 500,
            deleted: false,
        };
        let mut remote = CategoryDocument::from_local(&local);
        remote.deleted = true;
        remote.modified = 1;

        assert_eq!(
            merge_category(Some(&local), &remote),
            MergeOutcome::Hidden { id: "cat".into() }
        );
    }

    #[test]
    fn test_local_delete_stays_deleted() {
        let mut local = manga("m1", 100);
        local.deleted = true;
        let remote = MangaDocument::from_local(&manga("m1", 900), &[]);

        assert_eq!(merge_manga_down(Some(&local), &[], &remote), MangaMerge::unchanged());
    }

    #[test]
    fn test_deleted_remote_unknown_locally_is_ignored() {
        let mut remote = MangaDocument::from_local(&manga("m1", 100), &[]);
        remote.deleted = true;
        assert_eq!(merge_manga_down(None, &[], &remote).change_count(), 0);
    }

    // -------------------------------------------------------------------------
    // Up direction
    // -------------------------------------------------------------------------

    #[test]
    fn test_merge_up_never_regresses_remote_progress() {
        let local = manga("m1", 100);
        let mut local_ch = chapter("c1", "m1", 100);
        local_ch.last_page_read = 2;

        let mut remote = MangaDocument::from_local(&local, &[]);
        remote
            .chapters
            .insert("c1".into(), remote_chapter("c1", true, 8, 50));
        remote
            .chapters
            .insert("c2".into(), remote_chapter("c2", true, 1, 50));

        let doc = merge_manga_up(&local, &[local_ch], Some(&remote));
        assert!(doc.chapters["c1"].is_read);
        assert_eq!(doc.chapters["c1"].last_page_read, 8);
        assert!(doc.chapters.contains_key("c2"));
    }

    #[test]
    fn test_merge_up_keeps_newer_remote_scalars() {
        let local = manga("m1", 100);
        let mut remote = MangaDocument::from_local(&local, &[]);
        remote.title = "Remote title".into();
        remote.modified = 200;

        let doc = merge_manga_up(&local, &[], Some(&remote));
        assert_eq!(doc.title, "Remote title");
        assert_eq!(doc.modified, 200);
    }

    #[test]
    fn test_chapter_up_keeps_remote_progress() {
        let mut stale = chapter("c1", "m1", 100);
        stale.last_page_read = 4;
        let remote = remote_chapter("c1", true, 20, 50);

        let doc = merge_chapter_up(&stale, Some(&remote));
        assert!(doc.is_read);
        assert_eq!(doc.last_page_read, 20);
        assert_eq!(doc.modified, 100);
    }

    #[test]
    fn test_chapter_up_keeps_remote_delete() {
        let local = chapter("c1", "m1", 900);
        let mut remote = remote_chapter("c1", false, 0, 10);
        remote.deleted = true;

        assert!(merge_chapter_up(&local, Some(&remote)).deleted);
    }

    #[test]
    fn test_category_up_does_not_resurrect() {
        let local = Category {
            id: "cat".into(),
            name: "Reading".into(),
            sort_order: 0,
            flags: 0,
            modified: 100,
            deleted: false,
        };
        let mut remote = CategoryDocument::from_local(&local);
        remote.name = "Later".into();
        remote.deleted = true;
        remote.modified = 500;

        let doc = merge_category_up(&local, Some(&remote));
        assert!(doc.deleted);
        assert_eq!(doc.modified, 500);
        assert_eq!(doc.name, "Later");
    }

    #[test]
    fn test_history_up_takes_max() {
        let local = HistoryEntry {
            id: "h1".into(),
            manga_id: "m1".into(),
            chapter_id: "c1".into(),
            last_read: 700,
            time_read_ms: 10,
            modified: 700,
            deleted: false,
        };
        let mut remote = HistoryDocument::from_local(&local);
        remote.chapter_id = "c2".into();
        remote.last_read = 900;
        remote.modified = 900;

        let doc = merge_history_up(&local, Some(&remote));
        assert_eq!(doc.chapter_id, "c2");
        assert_eq!(doc.last_read, 900);
        assert_eq!(doc.time_read_ms, 10);
        assert_eq!(doc.modified, 900);
    }

    #[test]
    fn test_settings_up_keeps_newer_remote() {
        let local = LibrarySettings {
            id: "preferences".into(),
            values: [("theme".to_string(), serde_json::json!("dark"))].into(),
            modified: 10,
        };
        let mut remote = SettingsDocument::from_local(&local);
        remote.values.insert("theme".into(), serde_json::json!("light"));
        remote.modified = 20;

        assert_eq!(merge_settings_up(&local, Some(&remote)).values["theme"], "light");
        assert_eq!(merge_settings_up(&local, None).values["theme"], "dark");
    }

    #[test]
    fn test_stub_document_does_not_create_manga() {
        let mut stub = MangaDocument::from_local(&manga("m1", 0), &[]);
        stub.title.clear();
        stub.chapters.insert("c1".into(), remote_chapter("c1", true, 3, 10));
        assert_eq!(merge_manga_down(None, &[], &stub).change_count(), 0);

        let local = manga("m1", 100);
        let local_ch = chapter("c1", "m1", 100);
        let result = merge_manga_down(Some(&local), &[local_ch], &stub);
        assert_eq!(result.manga, MergeOutcome::Unchanged);
        let MergeOutcome::Updated(ch) = &result.chapters[0] else {
            panic!("expected chapter update");
        };
        assert!(ch.is_read);
    }
}
