//! # Inbound Applier
//!
//! Writes merged remote state into the local library.
//!
//! ## Per-Document Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  RemoteDocument ──► read local state ──► merge (tome-core::merge)      │
//! │                                               │                         │
//! │                          ┌────────────────────┼──────────────────┐      │
//! │                          ▼                    ▼                  ▼      │
//! │                      Unchanged        Created / Updated       Hidden    │
//! │                      (nothing)        Upsert mutation      Hide mutation│
//! │                                                            + drop queued│
//! │                                                              local edit │
//! │                                                                         │
//! │  mutations of one document ──► one write_transaction                   │
//! │                                (capture suspended, no echo event)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failing document is logged and counted; the rest of the batch is still
//! applied.

use std::sync::Arc;

use tome_core::merge::{
    merge_category, merge_history, merge_manga_down, merge_settings, MergeOutcome,
};
use tome_core::{
    event_key, Collection, EntityType, LibraryEntity, MangaDocument, RemoteDocument,
};
use tracing::{debug, warn};

use crate::capture::SuspendToken;
use crate::error::SyncResult;
use crate::local::{self, LocalMutation, LocalRepository};
use crate::queue::EventQueue;
use crate::remote::RawDocument;

/// Counts from applying a set of remote documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entities created locally.
    pub created: usize,
    /// Entities updated locally.
    pub updated: usize,
    /// Entities hidden because the remote copy is deleted.
    pub hidden: usize,
    /// Documents that changed nothing.
    pub unchanged: usize,
    /// Documents skipped because they could not be decoded.
    pub invalid: usize,
    /// Documents whose local write failed.
    pub failed: usize,
    /// Queued local edits dropped in favor of a remote deletion.
    pub dropped_events: usize,
}

impl MergeReport {
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.hidden
    }

    pub fn absorb(&mut self, other: MergeReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.hidden += other.hidden;
        self.unchanged += other.unchanged;
        self.invalid += other.invalid;
        self.failed += other.failed;
        self.dropped_events += other.dropped_events;
    }

    fn count<T>(&mut self, outcome: &MergeOutcome<T>) {
        match outcome {
            MergeOutcome::Unchanged => {}
            MergeOutcome::Created(_) => self.created += 1,
            MergeOutcome::Updated(_) => self.updated += 1,
            MergeOutcome::Hidden { .. } => self.hidden += 1,
        }
    }
}

/// Decodes raw documents, counting the ones that do not fit.
pub fn decode_documents(
    collection: Collection,
    raw: &[RawDocument],
) -> (Vec<RemoteDocument>, usize) {
    let mut invalid = 0;
    let docs = raw
        .iter()
        .filter_map(|doc| match RemoteDocument::decode(collection, &doc.id, &doc.data) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(collection = %collection, id = %doc.id, error = %e, "Skipping invalid document");
                invalid += 1;
                None
            }
        })
        .collect();
    (docs, invalid)
}

/// Applies remote documents to the local library.
#[derive(Clone)]
pub struct InboundApplier {
    local: Arc<dyn LocalRepository>,
    queue: Arc<EventQueue>,
    suspend: SuspendToken,
}

impl InboundApplier {
    pub fn new(local: Arc<dyn LocalRepository>, queue: Arc<EventQueue>, suspend: SuspendToken) -> Self {
        Self {
            local,
            queue,
            suspend,
        }
    }

    /// Merges and writes each document.
    pub async fn apply(&self, docs: &[RemoteDocument]) -> MergeReport {
        let mut report = MergeReport::default();

        for doc in docs {
            let mut doc_report = MergeReport::default();
            match self.apply_document(doc, &mut doc_report).await {
                Ok(()) => report.absorb(doc_report),
                Err(e) => {
                    warn!(
                        collection = %doc.collection(),
                        id = doc.id(),
                        error = %e,
                        "Failed to apply remote document"
                    );
                    report.failed += 1;
                }
            }
        }

        debug!(
            documents = docs.len(),
            created = report.created,
            updated = report.updated,
            hidden = report.hidden,
            failed = report.failed,
            "Remote documents applied"
        );
        report
    }

    /// Decodes, then applies raw documents of one collection.
    pub async fn apply_raw(&self, collection: Collection, raw: &[RawDocument]) -> MergeReport {
        let (docs, invalid) = decode_documents(collection, raw);
        let mut report = self.apply(&docs).await;
        report.invalid += invalid;
        report
    }

    async fn apply_document(&self, doc: &RemoteDocument, report: &mut MergeReport) -> SyncResult<()> {
        let repo = self.local.as_ref();
        let mut mutations = Vec::new();
        let mut dropped_keys = Vec::new();

        match doc {
            RemoteDocument::Manga(remote) => {
                self.merge_manga(remote, &mut mutations, &mut dropped_keys, report)
                    .await?;
            }
            RemoteDocument::Category(remote) => {
                let local = local::get_category(repo, &remote.id).await?;
                let outcome = merge_category(local.as_ref(), remote);
                report.count(&outcome);
                push_outcome(
                    outcome,
                    EntityType::Category,
                    LibraryEntity::Category,
                    &mut mutations,
                    &mut dropped_keys,
                );
            }
            RemoteDocument::History(remote) => {
                let local = local::get_history(repo, &remote.id).await?;
                let outcome = merge_history(local.as_ref(), remote);
                report.count(&outcome);
                push_outcome(
                    outcome,
                    EntityType::History,
                    LibraryEntity::History,
                    &mut mutations,
                    &mut dropped_keys,
                );
            }
            RemoteDocument::Settings(remote) => {
                let local = local::get_settings(repo, &remote.id).await?;
                let outcome = merge_settings(local.as_ref(), remote);
                report.count(&outcome);
                push_outcome(
                    outcome,
                    EntityType::Settings,
                    LibraryEntity::Settings,
                    &mut mutations,
                    &mut dropped_keys,
                );
            }
        }

        if mutations.is_empty() {
            report.unchanged += 1;
        } else {
            let _guard = self.suspend.suspend();
            self.local.write_transaction(mutations).await?;
        }

        for key in dropped_keys {
            if let Some(event) = self.queue.get(&key).await {
                if self.queue.ack(&[event.id]).await > 0 {
                    debug!(key = %key, "Dropped queued edit of remotely deleted entity");
                    report.dropped_events += 1;
                }
            }
        }

        Ok(())
    }

    async fn merge_manga(
        &self,
        remote: &MangaDocument,
        mutations: &mut Vec<LocalMutation>,
        dropped_keys: &mut Vec<String>,
        report: &mut MergeReport,
    ) -> SyncResult<()> {
        let local = local::get_manga(self.local.as_ref(), &remote.id).await?;
        let chapters = self.local.chapters_for(&remote.id).await?;
        let merged = merge_manga_down(local.as_ref(), &chapters, remote);

        if let MergeOutcome::Hidden { .. } = merged.manga {
            // The whole entry goes, together with queued edits of its chapters.
            dropped_keys.extend(
                chapters
                    .iter()
                    .map(|c| event_key(EntityType::Chapter, &c.id)),
            );
        }

        report.count(&merged.manga);
        push_outcome(
            merged.manga,
            EntityType::Manga,
            LibraryEntity::Manga,
            mutations,
            dropped_keys,
        );

        for outcome in merged.chapters {
            report.count(&outcome);
            push_outcome(
                outcome,
                EntityType::Chapter,
                LibraryEntity::Chapter,
                mutations,
                dropped_keys,
            );
        }

        Ok(())
    }
}

fn push_outcome<T>(
    outcome: MergeOutcome<T>,
    entity_type: EntityType,
    wrap: impl FnOnce(T) -> LibraryEntity,
    mutations: &mut Vec<LocalMutation>,
    dropped_keys: &mut Vec<String>,
) {
    match outcome {
        MergeOutcome::Unchanged => {}
        MergeOutcome::Created(value) | MergeOutcome::Updated(value) => {
            mutations.push(LocalMutation::Upsert(wrap(value)));
        }
        MergeOutcome::Hidden { id } => {
            dropped_keys.push(event_key(entity_type, &id));
            mutations.push(LocalMutation::Hide { entity_type, id });
        }
    }
}

impl std::fmt::Debug for InboundApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundApplier").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ChangeCapture;
    use crate::clock::MonotonicClock;
    use crate::config::CaptureSettings;
    use crate::memory::MemoryLibrary;
    use crate::persist::SyncStorage;
    use crate::queue::RetryPolicy;
    use crate::fixtures::{chapter, manga};
    use tome_core::{ChapterDocument, SyncEvent};
    use tome_store::MemoryKvStore;

    struct Fixture {
        library: Arc<MemoryLibrary>,
        queue: Arc<EventQueue>,
        applier: InboundApplier,
        capture: ChangeCapture,
        _subscription: crate::capture::Subscription,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(MonotonicClock::new());
        let library = Arc::new(MemoryLibrary::new());
        let queue = Arc::new(EventQueue::new(
            SyncStorage::new(Arc::new(MemoryKvStore::new())),
            clock.clone(),
            100,
            RetryPolicy::default(),
        ));
        let token = SuspendToken::new();
        let capture = ChangeCapture::spawn(queue.clone(), clock, CaptureSettings::default(), token.clone());
        let subscription = capture.attach(library.as_ref());
        let applier = InboundApplier::new(library.clone(), queue.clone(), token);
        Fixture {
            library,
            queue,
            applier,
            capture,
            _subscription: subscription,
        }
    }

    fn remote_manga(id: &str, modified: i64) -> MangaDocument {
        MangaDocument::from_local(&manga(id, modified), &[])
    }

    #[tokio::test]
    async fn test_new_remote_manga_created_without_echo() {
        let fx = fixture();
        let mut doc = remote_manga("m1", 10);
        let mut ch = ChapterDocument::from_local(&chapter("c1", "m1", 10));
        ch.is_read = true;
        doc.chapters.insert("c1".into(), ch);

        let report = fx.applier.apply(&[RemoteDocument::Manga(doc)]).await;
        assert_eq!(report.created, 2);
        assert!(fx.library.manga("m1").is_some());
        assert!(fx.library.chapter("c1").unwrap().is_read);

        // Capture was suspended during the write
        assert_eq!(fx.capture.flush_pending().await.unwrap(), 0);
        assert!(fx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_progress_merges_monotonically() {
        let fx = fixture();
        fx.library.seed(LibraryEntity::Manga(manga("m1", 10)));
        let mut local = chapter("c1", "m1", 50);
        local.last_page_read = 12;
        fx.library.seed(LibraryEntity::Chapter(local));

        let mut doc = remote_manga("m1", 10);
        let mut ch = ChapterDocument::from_local(&chapter("c1", "m1", 5));
        ch.is_read = true;
        ch.last_page_read = 3;
        doc.chapters.insert("c1".into(), ch);

        let report = fx.applier.apply(&[RemoteDocument::Manga(doc)]).await;
        assert_eq!(report.updated, 1);
        let merged = fx.library.chapter("c1").unwrap();
        assert!(merged.is_read);
        assert_eq!(merged.last_page_read, 12);
    }

    #[tokio::test]
    async fn test_remote_delete_hides_and_drops_queued_edit() {
        let fx = fixture();
        fx.library.seed(LibraryEntity::Manga(manga("m1", 10)));
        fx.library.seed(LibraryEntity::Chapter(chapter("c1", "m1", 10)));

        for (ty, id) in [(EntityType::Manga, "m1"), (EntityType::Chapter, "c1")] {
            let payload = match ty {
                EntityType::Manga => LibraryEntity::Manga(manga("m1", 20)),
                _ => LibraryEntity::Chapter(chapter("c1", "m1", 20)),
            }
            .to_payload()
            .unwrap();
            fx.queue
                .enqueue(SyncEvent::new(ty, id, tome_core::EventKind::Update, payload, 20, 1_000))
                .await
                .unwrap();
        }

        let mut doc = remote_manga("m1", 30);
        doc.deleted = true;
        let report = fx.applier.apply(&[RemoteDocument::Manga(doc)]).await;

        assert_eq!(report.hidden, 1);
        assert_eq!(report.dropped_events, 2);
        assert!(fx.library.manga("m1").unwrap().deleted);
        assert!(fx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_documents_skipped() {
        let fx = fixture();
        let raw = vec![
            RawDocument {
                id: "m1".into(),
                data: serde_json::to_value(remote_manga("m1", 1)).unwrap(),
            },
            RawDocument {
                id: "m2".into(),
                data: serde_json::json!({ "title": 42 }),
            },
        ];
        let report = fx.applier.apply_raw(Collection::Manga, &raw).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.invalid, 1);
    }

    #[tokio::test]
    async fn test_local_write_failure_counted() {
        let fx = fixture();
        fx.library.set_fail_writes(true);
        let report = fx
            .applier
            .apply(&[RemoteDocument::Manga(remote_manga("m1", 1))])
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.changes(), 0);
    }

    #[tokio::test]
    async fn test_host_writes_are_still_captured() {
        let fx = fixture();
        fx.applier
            .apply(&[RemoteDocument::Manga(remote_manga("m1", 1))])
            .await;

        // Suspension ended with the inbound write
        fx.library.upsert(LibraryEntity::Manga(manga("m1", 2)));
        assert_eq!(fx.capture.flush_pending().await.unwrap(), 1);
        assert_eq!(fx.queue.get("manga:m1").await.unwrap().kind, tome_core::EventKind::Update);
    }
}
