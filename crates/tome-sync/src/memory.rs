//! # In-Memory Emulators
//!
//! [`MemoryRemoteStore`] behaves like the remote document store: field-level
//! merge writes, atomic batches with an operation ceiling, `updated_at`
//! queries and per-collection change streams. [`MemoryLibrary`] stands in for
//! the host database and notifies change sinks after every write.
//!
//! Both support injected failures so outages, credential revocation and
//! dropped listeners can be exercised without a network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tome_core::document::deep_merge;
use tome_core::{Chapter, Collection, EntityType, LibraryEntity, Manga, RemoteDocument};
use tracing::debug;

use crate::capture::{ChangeSet, ChangeSink, ChangeSource, Subscription};
use crate::error::{SyncError, SyncResult};
use crate::local::{LocalMutation, LocalRepository};
use crate::remote::{
    ChangeStream, OrderBy, RawDocument, RemoteChange, RemoteQuery, RemoteStore, WriteBatch,
};

/// Default write ceiling, matching common document stores.
pub const DEFAULT_MAX_BATCH: usize = 500;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Remote Store
// =============================================================================

/// Injected commit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient outage.
    Unavailable,
    /// Credential revoked.
    Unauthenticated,
    /// Permanent rejection.
    Rejected,
    /// Never completes; the caller's timeout fires.
    Hang,
}

type ChangeSender = mpsc::UnboundedSender<SyncResult<Vec<RemoteChange>>>;

struct Listener {
    path: String,
    tx: ChangeSender,
}

/// Remote document store held in memory.
pub struct MemoryRemoteStore {
    /// Collection path → document id → data.
    documents: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    max_batch: usize,
    commit_sizes: Mutex<Vec<usize>>,
    failures: Mutex<VecDeque<FailureKind>>,
    subscribe_failures: AtomicUsize,
    offline: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::with_max_batch(DEFAULT_MAX_BATCH)
    }

    /// Store that rejects batches larger than `max_batch`.
    pub fn with_max_batch(max_batch: usize) -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            max_batch,
            commit_sizes: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            subscribe_failures: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `count` commits fail.
    pub fn fail_next(&self, count: usize, kind: FailureKind) {
        lock(&self.failures).extend(std::iter::repeat(kind).take(count));
    }

    /// Makes the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.subscribe_failures.fetch_add(count, Ordering::SeqCst);
    }

    /// While offline every operation fails as unavailable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Ends every open change stream with an error.
    pub fn disconnect_listeners(&self) {
        let listeners = std::mem::take(&mut *lock(&self.listeners));
        for listener in listeners {
            let _ = listener
                .tx
                .send(Err(SyncError::StreamClosed(listener.path.clone())));
        }
    }

    pub fn listener_count(&self) -> usize {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|l| !l.tx.is_closed());
        listeners.len()
    }

    /// Successful commits.
    pub fn commit_count(&self) -> usize {
        lock(&self.commit_sizes).len()
    }

    /// Write count of each successful commit, in order.
    pub fn commit_sizes(&self) -> Vec<usize> {
        lock(&self.commit_sizes).clone()
    }

    /// Stored data of one document.
    pub fn document(&self, user_id: &str, collection: Collection, id: &str) -> Option<Value> {
        lock(&self.documents)
            .get(&collection.path(user_id))
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// One document, decoded.
    pub fn decoded(&self, user_id: &str, collection: Collection, id: &str) -> Option<RemoteDocument> {
        self.document(user_id, collection, id)
            .and_then(|data| RemoteDocument::decode(collection, id, &data).ok())
    }

    /// Merges `data` into a document as another client would, notifying
    /// listeners.
    pub fn put_document(&self, user_id: &str, collection: Collection, id: &str, data: Value) {
        let path = collection.path(user_id);
        let merged = self.merge_into(&path, id, &data);
        self.notify(&path, vec![RemoteChange::Upserted(RawDocument {
            id: id.to_string(),
            data: merged,
        })]);
    }

    /// Removes a document outright, notifying listeners.
    pub fn remove_document(&self, user_id: &str, collection: Collection, id: &str) {
        let path = collection.path(user_id);
        let removed = lock(&self.documents)
            .get_mut(&path)
            .and_then(|docs| docs.remove(id));
        if removed.is_some() {
            self.notify(&path, vec![RemoteChange::Removed { id: id.to_string() }]);
        }
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::RemoteUnavailable("store offline".into()));
        }
        Ok(())
    }

    fn merge_into(&self, path: &str, id: &str, data: &Value) -> Value {
        let mut documents = lock(&self.documents);
        let doc = documents
            .entry(path.to_string())
            .or_default()
            .entry(id.to_string())
            .or_insert_with(|| json!({}));
        deep_merge(doc, data);
        doc.clone()
    }

    fn notify(&self, path: &str, changes: Vec<RemoteChange>) {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|l| l.path != path || l.tx.send(Ok(changes.clone())).is_ok());
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemoteStore")
            .field("max_batch", &self.max_batch)
            .field("commits", &self.commit_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn max_batch_operations(&self) -> usize {
        self.max_batch
    }

    async fn commit(&self, batch: WriteBatch) -> SyncResult<()> {
        self.check_online()?;

        let failure = lock(&self.failures).pop_front();
        match failure {
            Some(FailureKind::Unavailable) => {
                return Err(SyncError::RemoteUnavailable("simulated outage".into()))
            }
            Some(FailureKind::Unauthenticated) => {
                return Err(SyncError::Unauthenticated("credential revoked".into()))
            }
            Some(FailureKind::Rejected) => {
                return Err(SyncError::RemoteRejected("permission denied".into()))
            }
            Some(FailureKind::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        if batch.len() > self.max_batch {
            return Err(SyncError::RemoteRejected(format!(
                "batch of {} writes exceeds limit of {}",
                batch.len(),
                self.max_batch
            )));
        }

        // Atomic: every write lands before any listener hears of it.
        let mut changes: Vec<(String, RawDocument)> = Vec::with_capacity(batch.len());
        for op in &batch.ops {
            let path = op.collection.path(&batch.user_id);
            let merged = self.merge_into(&path, &op.document_id, &op.fields);
            changes.push((
                path,
                RawDocument {
                    id: op.document_id.clone(),
                    data: merged,
                },
            ));
        }
        lock(&self.commit_sizes).push(batch.len());

        let mut by_path: BTreeMap<String, Vec<RemoteChange>> = BTreeMap::new();
        for (path, doc) in changes {
            by_path.entry(path).or_default().push(RemoteChange::Upserted(doc));
        }
        for (path, changes) in by_path {
            self.notify(&path, changes);
        }

        debug!(user_id = %batch.user_id, writes = batch.len(), "Memory store committed batch");
        Ok(())
    }

    async fn query(
        &self,
        user_id: &str,
        collection: Collection,
        query: RemoteQuery,
    ) -> SyncResult<Vec<RawDocument>> {
        self.check_online()?;

        let mut docs: Vec<RawDocument> = lock(&self.documents)
            .get(&collection.path(user_id))
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| RawDocument {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let stamp = |doc: &RawDocument, field: &str| doc.data.get(field).and_then(Value::as_i64).unwrap_or(0);

        if let Some(after) = query.modified_after {
            docs.retain(|doc| stamp(doc, "updated_at") > after);
        }
        match query.order_by {
            Some(OrderBy::UpdatedAt) => docs.sort_by_key(|doc| stamp(doc, "updated_at")),
            Some(OrderBy::LastReadDesc) => {
                docs.sort_by_key(|doc| std::cmp::Reverse(stamp(doc, "last_read")))
            }
            None => {}
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }

        Ok(docs)
    }

    async fn fetch(
        &self,
        user_id: &str,
        collection: Collection,
        ids: &[String],
    ) -> SyncResult<Vec<RawDocument>> {
        self.check_online()?;

        let documents = lock(&self.documents);
        let Some(docs) = documents.get(&collection.path(user_id)) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| {
                docs.get(id).map(|data| RawDocument {
                    id: id.clone(),
                    data: data.clone(),
                })
            })
            .collect())
    }

    async fn subscribe(&self, user_id: &str, collection: Collection) -> SyncResult<ChangeStream> {
        self.check_online()?;
        let failing = self
            .subscribe_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::RemoteUnavailable("listener refused".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let path = collection.path(user_id);
        debug!(path = %path, "Memory store listener opened");
        lock(&self.listeners).push(Listener { path, tx });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

// =============================================================================
// Local Library
// =============================================================================

type SinkList = Mutex<Vec<(u64, Arc<dyn ChangeSink>)>>;

/// Host library held in memory.
pub struct MemoryLibrary {
    entities: Mutex<BTreeMap<(EntityType, String), LibraryEntity>>,
    sinks: Arc<SinkList>,
    next_sink: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self {
            entities: Mutex::new(BTreeMap::new()),
            sinks: Arc::new(Mutex::new(Vec::new())),
            next_sink: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Stores an entity without notifying anyone.
    pub fn seed(&self, entity: LibraryEntity) {
        lock(&self.entities).insert((entity.entity_type(), entity.id().to_string()), entity);
    }

    /// Stores an entity as the host app would, notifying change sinks.
    pub fn upsert(&self, entity: LibraryEntity) {
        let previous = lock(&self.entities)
            .insert((entity.entity_type(), entity.id().to_string()), entity.clone());

        let mut changes = ChangeSet::default();
        match previous {
            Some(_) => changes.modified.push(entity),
            None => changes.inserted.push(entity),
        }
        self.notify(&changes);
    }

    /// Soft-deletes an entity as the host app would. Returns false when it
    /// was missing or already deleted.
    pub fn delete(&self, entity_type: EntityType, id: &str, modified: i64) -> bool {
        let snapshot = {
            let mut entities = lock(&self.entities);
            match entities.get_mut(&(entity_type, id.to_string())) {
                Some(entity) if !entity.is_deleted() => {
                    entity.mark_deleted(modified);
                    entity.clone()
                }
                _ => return false,
            }
        };

        self.notify(&ChangeSet {
            deleted: vec![snapshot],
            ..ChangeSet::default()
        });
        true
    }

    pub fn entity(&self, entity_type: EntityType, id: &str) -> Option<LibraryEntity> {
        lock(&self.entities).get(&(entity_type, id.to_string())).cloned()
    }

    pub fn manga(&self, id: &str) -> Option<Manga> {
        match self.entity(EntityType::Manga, id) {
            Some(LibraryEntity::Manga(m)) => Some(m),
            _ => None,
        }
    }

    pub fn chapter(&self, id: &str) -> Option<Chapter> {
        match self.entity(EntityType::Chapter, id) {
            Some(LibraryEntity::Chapter(c)) => Some(c),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entities).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes every write transaction fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn notify(&self, changes: &ChangeSet) {
        if changes.is_empty() {
            return;
        }
        // Sinks run without the lock held; they may read the library.
        let sinks: Vec<Arc<dyn ChangeSink>> =
            lock(&self.sinks).iter().map(|(_, sink)| sink.clone()).collect();
        for sink in sinks {
            sink.on_change(changes);
        }
    }
}

impl Default for MemoryLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLibrary")
            .field("entities", &self.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LocalRepository for MemoryLibrary {
    async fn get(&self, entity_type: EntityType, id: &str) -> SyncResult<Option<LibraryEntity>> {
        Ok(self.entity(entity_type, id))
    }

    async fn list(&self, entity_type: EntityType) -> SyncResult<Vec<LibraryEntity>> {
        Ok(lock(&self.entities)
            .iter()
            .filter(|((ty, _), _)| *ty == entity_type)
            .map(|(_, entity)| entity.clone())
            .collect())
    }

    async fn chapters_for(&self, manga_id: &str) -> SyncResult<Vec<Chapter>> {
        Ok(lock(&self.entities)
            .values()
            .filter_map(|entity| match entity {
                LibraryEntity::Chapter(c) if c.manga_id == manga_id => Some(c.clone()),
                _ => None,
            })
            .collect())
    }

    async fn write_transaction(&self, mutations: Vec<LocalMutation>) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::LocalWriteFailed("disk full".into()));
        }

        let mut changes = ChangeSet::default();
        {
            let mut entities = lock(&self.entities);
            for mutation in mutations {
                match mutation {
                    LocalMutation::Upsert(entity) => {
                        let key = (entity.entity_type(), entity.id().to_string());
                        match entities.insert(key, entity.clone()) {
                            Some(_) => changes.modified.push(entity),
                            None => changes.inserted.push(entity),
                        }
                    }
                    LocalMutation::Hide { entity_type, id } => {
                        if let Some(entity) = entities.get_mut(&(entity_type, id)) {
                            if !entity.is_deleted() {
                                let modified = entity.modified();
                                entity.mark_deleted(modified);
                                changes.deleted.push(entity.clone());
                            }
                        }
                    }
                }
            }
        }

        self.notify(&changes);
        Ok(())
    }
}

impl ChangeSource for MemoryLibrary {
    fn subscribe(&self, sink: Arc<dyn ChangeSink>) -> Subscription {
        let id = self.next_sink.fetch_add(1, Ordering::SeqCst);
        lock(&self.sinks).push((id, sink));

        let sinks: Weak<SinkList> = Arc::downgrade(&self.sinks);
        Subscription::new(move || {
            if let Some(sinks) = sinks.upgrade() {
                lock(&sinks).retain(|(sink_id, _)| *sink_id != id);
            }
        })
    }
}
