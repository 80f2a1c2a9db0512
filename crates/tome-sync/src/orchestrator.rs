//! # Sync Orchestrator
//!
//! Drives every exchange with the remote store: draining the event queue,
//! full downloads and uploads, catch-up after reconnects, and the
//! pause/resume/logout lifecycle.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │              flush()                       download_and_merge()         │
//! │   ┌──────┐ ─────────► ┌──────────┐   ┌──────┐ ──────► ┌─────────────┐  │
//! │   │ Idle │            │ Flushing │   │ Idle │         │ Downloading │  │
//! │   └──────┘ ◄───────── └────┬─────┘   └──────┘ ◄────── └──────┬──────┘  │
//! │      ▲ ▲      done         │ failure                         │ failure │
//! │      │ │                   ▼                                 ▼         │
//! │      │ │              ┌─────────┐  next success         ┌─────────┐    │
//! │      │ └───────────── │  Error  │ ◄──────────────────── │  Error  │    │
//! │      │                └─────────┘                       └─────────┘    │
//! │      │ resume()                                                         │
//! │   ┌──┴─────┐                                                            │
//! │   │ Paused │ ◄── pause() from any state (in-flight flush finishes)     │
//! │   └────────┘                                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Flush
//! ```text
//! dequeue_batch(batch_size)          high → normal → low
//!        │
//!        ▼
//! event ──► LibraryEntity                    unconvertible: permanent failure
//!        │
//!        ▼
//! group by entity type (first appearance), chunk at the batch ceiling
//!        │
//!        ▼
//! fetch current remote documents of the chunk
//!        │
//!        ▼
//! merge up ──► DocumentPatch ──► WriteOp      updated_at = commit time
//!        │
//!        ▼
//! commit chunk ── ok ──► ack ids
//!        │
//!        ├── auth error ──► stop, needs_reauth, flush suspended
//!        ├── retryable  ──► requeue_with_backoff(retryable), stop
//!        └── rejected   ──► requeue_with_backoff(permanent), next chunk
//! ```
//!
//! Within one flush a chunk is attempted up to `commit_attempts` times with
//! exponential backoff and a per-attempt timeout. Across flushes the queue's
//! retry count bounds how often an event is attempted.
//!
//! Every write is merged against the remote copy read just before it, so a
//! stale queued snapshot never clears a remote delete, lowers `modified` or
//! regresses progress. `updated_at` is the commit time rather than the edit
//! time: incremental readers filtering on it must see writes that were queued
//! long before they reached the store.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tome_core::document::deep_merge;
use tome_core::merge::merge_manga_up;
use tome_core::validation::validate_entity_id;
use tome_core::{
    CategoryDocument, Collection, CoreResult, DocumentPatch, EntityType, HistoryDocument,
    LibraryEntity, MangaDocument, RemoteDocument, SettingsDocument, SyncPhase, SyncState,
};
use tracing::{debug, error, info, warn};

use crate::auth::AuthBridge;
use crate::clock::MonotonicClock;
use crate::config::SyncSettings;
use crate::echo::EchoFilter;
use crate::error::{SyncError, SyncResult};
use crate::inbound::{decode_documents, InboundApplier, MergeReport};
use crate::local::{get_manga, LocalRepository, LocalSnapshot};
use crate::persist::{SyncMetadata, SyncStorage};
use crate::queue::{EventQueue, RequeueOutcome};
use crate::remote::{OrderBy, RemoteQuery, RemoteStore, WriteBatch, WriteOp};
use crate::state::StatePublisher;

// =============================================================================
// Reports
// =============================================================================

/// Why a flush did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Paused,
    NoUser,
    AuthSuspended,
    AlreadySyncing,
    Empty,
}

/// Counts from a flush that ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    /// Events taken from the queue.
    pub attempted: usize,
    /// Events committed and acknowledged.
    pub written: usize,
    /// Events left queued for a later attempt.
    pub retrying: usize,
    /// Events dropped for good.
    pub failed: usize,
    /// Remote batches committed or attempted.
    pub batches: usize,
    /// Earliest useful retry, when events were requeued.
    pub retry_after: Option<Duration>,
    /// Last failure, if any.
    pub error: Option<String>,
}

/// Outcome of [`SyncOrchestrator::flush`].
#[derive(Debug, Clone, PartialEq)]
pub enum FlushReport {
    Skipped(SkipReason),
    Completed(FlushSummary),
}

impl FlushReport {
    pub fn is_skipped(&self) -> bool {
        matches!(self, FlushReport::Skipped(_))
    }

    /// Events written (0 when skipped).
    pub fn written(&self) -> usize {
        match self {
            FlushReport::Completed(summary) => summary.written,
            FlushReport::Skipped(_) => 0,
        }
    }

    pub fn summary(&self) -> Option<&FlushSummary> {
        match self {
            FlushReport::Completed(summary) => Some(summary),
            FlushReport::Skipped(_) => None,
        }
    }
}

/// Decoded remote state of one user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteSnapshot {
    pub manga: Vec<MangaDocument>,
    pub categories: Vec<CategoryDocument>,
    pub history: Vec<HistoryDocument>,
    pub settings: Vec<SettingsDocument>,
    /// Documents skipped because they could not be decoded.
    pub invalid: usize,
}

impl RemoteSnapshot {
    fn push(&mut self, doc: RemoteDocument) {
        match doc {
            RemoteDocument::Manga(d) => self.manga.push(d),
            RemoteDocument::Category(d) => self.categories.push(d),
            RemoteDocument::History(d) => self.history.push(d),
            RemoteDocument::Settings(d) => self.settings.push(d),
        }
    }

    /// All documents in apply order: categories before the manga filed
    /// under them.
    pub fn documents(&self) -> Vec<RemoteDocument> {
        self.categories
            .iter()
            .cloned()
            .map(RemoteDocument::Category)
            .chain(self.manga.iter().cloned().map(RemoteDocument::Manga))
            .chain(self.history.iter().cloned().map(RemoteDocument::History))
            .chain(self.settings.iter().cloned().map(RemoteDocument::Settings))
            .collect()
    }

    pub fn document_count(&self) -> usize {
        self.manga.len() + self.categories.len() + self.history.len() + self.settings.len()
    }
}

// =============================================================================
// Timer Control
// =============================================================================

/// What the flush timers may do. Every change also cancels a pending
/// debounce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerControl {
    /// Timers run (false while paused or after logout until resumed).
    pub running: bool,
    /// The periodic flush runs only in the foreground.
    pub foreground: bool,
}

impl Default for TimerControl {
    fn default() -> Self {
        Self {
            running: true,
            foreground: true,
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Collaborators of the orchestrator.
pub struct OrchestratorDeps {
    pub queue: Arc<EventQueue>,
    pub remote: Arc<dyn RemoteStore>,
    pub local: Arc<dyn LocalRepository>,
    pub auth: Arc<dyn AuthBridge>,
    pub applier: InboundApplier,
    pub storage: SyncStorage,
    pub clock: Arc<MonotonicClock>,
    pub echo: Arc<EchoFilter>,
    /// Stamped into every write as its author.
    pub device_id: String,
}

/// Coordinates queue draining, downloads and uploads. Share as
/// `Arc<SyncOrchestrator>`.
pub struct SyncOrchestrator {
    queue: Arc<EventQueue>,
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalRepository>,
    auth: Arc<dyn AuthBridge>,
    applier: InboundApplier,
    storage: SyncStorage,
    clock: Arc<MonotonicClock>,
    echo: Arc<EchoFilter>,
    device_id: String,
    settings: SyncSettings,

    /// Sole writer of the sync state.
    state: StatePublisher,

    /// Set while a flush runs.
    syncing: AtomicBool,
    paused: AtomicBool,

    /// Set after the remote rejected our credential.
    auth_suspended: AtomicBool,

    /// Timers should not flush before this point.
    retry_not_before: Mutex<Option<Instant>>,

    timers: watch::Sender<TimerControl>,
}

/// Clears the syncing flag when a flush ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncOrchestrator {
    pub fn new(deps: OrchestratorDeps, settings: SyncSettings) -> Self {
        let (timers, _) = watch::channel(TimerControl::default());
        Self {
            queue: deps.queue,
            remote: deps.remote,
            local: deps.local,
            auth: deps.auth,
            applier: deps.applier,
            storage: deps.storage,
            clock: deps.clock,
            echo: deps.echo,
            device_id: deps.device_id,
            settings,
            state: StatePublisher::default(),
            syncing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            auth_suspended: AtomicBool::new(false),
            retry_not_before: Mutex::new(None),
            timers,
        }
    }

    /// Loads persisted metadata into the sync state.
    pub async fn initialize(&self) {
        let metadata = match self.storage.load_metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(error = %e, "Failed to read sync metadata");
                SyncMetadata::default()
            }
        };
        let pending = self.queue.len().await;

        self.state.update(|s| {
            s.last_sync_timestamp = metadata.last_sync_timestamp;
            s.last_full_sync = metadata.last_full_sync;
            s.pending_count = pending;
        });
        info!(
            last_sync = metadata.last_sync_timestamp,
            pending, "Sync state initialized"
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> SyncState {
        self.state.snapshot()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn subscribe_timers(&self) -> watch::Receiver<TimerControl> {
        self.timers.subscribe()
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn applier(&self) -> &InboundApplier {
        &self.applier
    }

    pub fn echo(&self) -> &Arc<EchoFilter> {
        &self.echo
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_auth_suspended(&self) -> bool {
        self.auth_suspended.load(Ordering::SeqCst)
    }

    /// Earliest time the timers should flush again after requeued failures.
    pub fn retry_not_before(&self) -> Option<Instant> {
        *self.retry_guard()
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Writes up to one batch of queued events to the remote store.
    pub async fn flush(&self) -> FlushReport {
        if let Some(reason) = self.precheck().await {
            debug!(?reason, "Flush skipped");
            return FlushReport::Skipped(reason);
        }
        let Some(session) = self.auth.current_session().await else {
            return FlushReport::Skipped(SkipReason::NoUser);
        };

        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Flush already running");
            return FlushReport::Skipped(SkipReason::AlreadySyncing);
        }
        let _guard = SyncingGuard(&self.syncing);

        let batch = self.queue.dequeue_batch(self.settings.batch_size).await;
        if batch.is_empty() {
            return FlushReport::Skipped(SkipReason::Empty);
        }

        self.state.update(|s| {
            s.is_syncing = true;
            s.phase = SyncPhase::Flushing;
        });
        info!(events = batch.len(), user_id = %session.user_id, "Flushing event queue");

        let summary = self.flush_batch(&session.user_id, batch).await;
        self.finish_flush(&summary).await;

        FlushReport::Completed(summary)
    }

    async fn precheck(&self) -> Option<SkipReason> {
        if self.is_paused() {
            return Some(SkipReason::Paused);
        }
        if self.is_auth_suspended() {
            return Some(SkipReason::AuthSuspended);
        }
        match self.auth.current_session().await {
            None => Some(SkipReason::NoUser),
            Some(session) if session.is_expired() => {
                self.suspend_for_auth(&SyncError::Unauthenticated("session expired".into()));
                Some(SkipReason::AuthSuspended)
            }
            Some(_) => None,
        }
    }

    async fn flush_batch(&self, user_id: &str, batch: Vec<tome_core::SyncEvent>) -> FlushSummary {
        let mut summary = FlushSummary {
            attempted: batch.len(),
            ..FlushSummary::default()
        };

        // Group by entity type in order of first appearance.
        let mut groups: Vec<(EntityType, Vec<(String, LibraryEntity)>)> = Vec::new();
        for event in batch {
            match LibraryEntity::from_event(&event) {
                Ok(entity) => match groups.iter_mut().find(|(ty, _)| *ty == event.entity_type) {
                    Some((_, entities)) => entities.push((event.id, entity)),
                    None => groups.push((event.entity_type, vec![(event.id, entity)])),
                },
                Err(e) => {
                    warn!(key = %event.key(), error = %e, "Event cannot be written, dropping");
                    self.queue.requeue_with_backoff(&event.id, false).await;
                    summary.failed += 1;
                    summary.error = Some(e.to_string());
                }
            }
        }

        let ceiling = self.batch_ceiling();

        'groups: for (entity_type, entities) in groups {
            for chunk in entities.chunks(ceiling) {
                let ids: Vec<String> = chunk.iter().map(|(id, _)| id.clone()).collect();
                let snapshots: Vec<&LibraryEntity> = chunk.iter().map(|(_, e)| e).collect();
                summary.batches += 1;

                let updated_at = self.clock.now_ms();
                let built = match self.merged_ops(user_id, &snapshots, updated_at).await {
                    Ok(built) => built,
                    Err(e) => {
                        if self.fail_chunk(entity_type, &ids, e, &mut summary).await {
                            break 'groups;
                        }
                        continue;
                    }
                };

                let mut written_ids = Vec::with_capacity(ids.len());
                let mut ops = Vec::with_capacity(ids.len());
                for (id, result) in ids.iter().zip(built) {
                    match result {
                        Ok(mut op) => {
                            op.stamp_writer(&self.device_id);
                            written_ids.push(id.clone());
                            ops.push(op);
                        }
                        Err(e) => {
                            warn!(id = %id, error = %e, "Event cannot be written, dropping");
                            self.queue.requeue_with_backoff(id, false).await;
                            summary.failed += 1;
                            summary.error = Some(e.to_string());
                        }
                    }
                }
                if ops.is_empty() {
                    continue;
                }

                // The listener may deliver our write before commit returns.
                for op in &ops {
                    self.echo.record(op.path(user_id), op.updated_at);
                }
                let write = WriteBatch {
                    user_id: user_id.to_string(),
                    ops,
                };

                match self.commit_with_backoff(write).await {
                    Ok(()) => {
                        self.queue.ack(&written_ids).await;
                        summary.written += written_ids.len();
                        debug!(entity_type = %entity_type, ops = written_ids.len(), "Batch committed");
                    }
                    Err(e) => {
                        if self.fail_chunk(entity_type, &written_ids, e, &mut summary).await {
                            break 'groups;
                        }
                    }
                }
            }
        }

        summary
    }

    /// Requeues a chunk after a failed fetch or commit. Returns true when the
    /// rest of the flush must stop.
    async fn fail_chunk(
        &self,
        entity_type: EntityType,
        ids: &[String],
        e: SyncError,
        summary: &mut FlushSummary,
    ) -> bool {
        summary.error = Some(e.to_string());
        if e.is_auth_error() {
            self.suspend_for_auth(&e);
            return true;
        }

        let retryable = e.is_retryable();
        warn!(
            entity_type = %entity_type,
            ops = ids.len(),
            retryable,
            error = %e,
            "Batch failed"
        );
        for id in ids {
            match self.queue.requeue_with_backoff(id, retryable).await {
                RequeueOutcome::Retrying { delay, .. } => {
                    summary.retrying += 1;
                    summary.retry_after = Some(summary.retry_after.map_or(delay, |d| d.max(delay)));
                }
                RequeueOutcome::PermanentFailure(_) => summary.failed += 1,
                RequeueOutcome::NotFound => {}
            }
        }
        // Later chunks would hit the same outage.
        retryable
    }

    /// Builds one write per entity, each merged against the current remote
    /// copy of the document it lands in. Results line up with `entities`.
    ///
    /// A chapter whose manga document is missing or holds no manga fields
    /// yet carries the local manga's fields along, so the document it creates
    /// can be read back as a manga.
    async fn merged_ops(
        &self,
        user_id: &str,
        entities: &[&LibraryEntity],
        updated_at: i64,
    ) -> SyncResult<Vec<CoreResult<WriteOp>>> {
        let mut current: HashMap<(Collection, String), RemoteDocument> = HashMap::new();
        for collection in Collection::ALL {
            let mut ids: Vec<String> = entities
                .iter()
                .filter(|e| Collection::for_entity(e.entity_type()) == collection)
                .map(|e| e.document_id().to_string())
                .collect();
            ids.sort();
            ids.dedup();
            if ids.is_empty() {
                continue;
            }

            let raw = self
                .with_backoff("fetch", || self.remote.fetch(user_id, collection, &ids))
                .await?;
            let (docs, invalid) = decode_documents(collection, &raw);
            if invalid > 0 {
                warn!(collection = %collection, invalid, "Ignoring malformed remote documents");
            }
            for doc in docs {
                current.insert((collection, doc.id().to_string()), doc);
            }
        }

        let mut completed: HashSet<String> = HashSet::new();
        let mut ops = Vec::with_capacity(entities.len());
        for entity in entities {
            let collection = Collection::for_entity(entity.entity_type());
            let remote = current.get(&(collection, entity.document_id().to_string()));
            let mut patch = DocumentPatch::merged_up(entity, remote, updated_at);

            if let (Ok(patch), LibraryEntity::Chapter(chapter)) = (&mut patch, entity) {
                let bare = match remote {
                    Some(RemoteDocument::Manga(doc)) => doc.is_stub(),
                    _ => true,
                };
                if bare && completed.insert(chapter.manga_id.clone()) {
                    self.attach_owner(&chapter.manga_id, remote, patch).await;
                }
            }

            ops.push(patch.map(WriteOp::from));
        }

        Ok(ops)
    }

    /// Folds the local manga's fields into a chapter patch.
    async fn attach_owner(
        &self,
        manga_id: &str,
        remote: Option<&RemoteDocument>,
        patch: &mut DocumentPatch,
    ) {
        let owner = match get_manga(self.local.as_ref(), manga_id).await {
            Ok(Some(owner)) => owner,
            Ok(None) => return,
            Err(e) => {
                warn!(manga_id = %manga_id, error = %e, "Owner manga unreadable");
                return;
            }
        };
        match DocumentPatch::merged_up(&LibraryEntity::Manga(owner), remote, patch.updated_at) {
            Ok(mut owner_patch) => {
                deep_merge(&mut owner_patch.fields, &patch.fields);
                patch.fields = owner_patch.fields;
            }
            Err(e) => warn!(manga_id = %manga_id, error = %e, "Owner manga not attached"),
        }
    }

    async fn finish_flush(&self, summary: &FlushSummary) {
        let pending = self.queue.len().await;
        let now = self.clock.now_ms();
        let paused = self.is_paused();

        *self.retry_guard() = summary.retry_after.map(|after| Instant::now() + after);

        self.state.update(|s| {
            s.is_syncing = false;
            s.pending_count = pending;
            if summary.written > 0 {
                s.last_sync_timestamp = now;
            }
            match &summary.error {
                Some(err) => {
                    s.last_error = Some(err.clone());
                    s.phase = SyncPhase::Error;
                }
                None => {
                    s.last_error = None;
                    s.phase = if paused { SyncPhase::Paused } else { SyncPhase::Idle };
                }
            }
        });

        if summary.written > 0 {
            self.persist_metadata().await;
        }

        if let Some(err) = &summary.error {
            error!(
                written = summary.written,
                retrying = summary.retrying,
                failed = summary.failed,
                error = %err,
                "Flush finished with errors"
            );
        } else {
            info!(written = summary.written, batches = summary.batches, pending, "Flush complete");
        }
    }

    /// Writes per remote batch: the lower of our limit and the store's.
    fn batch_ceiling(&self) -> usize {
        self.remote
            .max_batch_operations()
            .min(self.settings.max_batch_operations)
            .max(1)
    }

    async fn commit_with_backoff(&self, batch: WriteBatch) -> SyncResult<()> {
        self.with_backoff("commit", || self.remote.commit(batch.clone()))
            .await
    }

    /// Runs a remote operation with a per-attempt timeout, retrying
    /// retryable failures up to `commit_attempts` times.
    async fn with_backoff<T, F, Fut>(&self, operation: &'static str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut backoff = self.create_backoff();
        let attempts = self.settings.commit_attempts.max(1);
        let deadline = self.settings.operation_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match timeout(deadline, op()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.settings.operation_timeout_ms)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(self.settings.max_backoff_ms));
                    debug!(operation, attempt, ?delay, error = %e, "Remote operation failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.settings.initial_backoff_ms),
            multiplier: self.settings.backoff_multiplier,
            max_interval: Duration::from_millis(self.settings.max_backoff_ms),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    // =========================================================================
    // Download
    // =========================================================================

    /// Reads the user's whole remote library. History is limited to the most
    /// recently read entries.
    pub async fn download_all(&self, user_id: &str) -> SyncResult<RemoteSnapshot> {
        self.download(user_id, None).await
    }

    /// Reads documents updated after `since_ms`.
    pub async fn download_since(&self, user_id: &str, since_ms: i64) -> SyncResult<RemoteSnapshot> {
        self.download(user_id, Some(since_ms)).await
    }

    async fn download(&self, user_id: &str, since: Option<i64>) -> SyncResult<RemoteSnapshot> {
        let mut snapshot = RemoteSnapshot::default();
        for collection in Collection::ALL {
            let (docs, invalid) = self.download_collection(user_id, collection, since).await?;
            snapshot.invalid += invalid;
            docs.into_iter().for_each(|doc| snapshot.push(doc));
        }

        debug!(
            documents = snapshot.document_count(),
            invalid = snapshot.invalid,
            ?since,
            "Remote library downloaded"
        );
        Ok(snapshot)
    }

    /// Reads and decodes one collection.
    pub async fn download_collection(
        &self,
        user_id: &str,
        collection: Collection,
        since: Option<i64>,
    ) -> SyncResult<(Vec<RemoteDocument>, usize)> {
        let mut query = match since {
            Some(ms) => RemoteQuery::since(ms),
            None => RemoteQuery::all(),
        };
        if collection == Collection::History {
            query = query
                .ordered_by(OrderBy::LastReadDesc)
                .with_limit(self.settings.history_download_limit);
        }

        let raw = self
            .with_backoff("query", || self.remote.query(user_id, collection, query.clone()))
            .await?;
        Ok(decode_documents(collection, &raw))
    }

    /// Downloads the whole remote library and merges it into local state.
    pub async fn download_and_merge(&self) -> SyncResult<MergeReport> {
        let user_id = self.require_user().await?;
        let started = self.clock.now_ms();
        self.state.update(|s| s.phase = SyncPhase::Downloading);
        info!(user_id = %user_id, "Downloading remote library");

        let snapshot = match self.download_all(&user_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        let mut report = self.applier.apply(&snapshot.documents()).await;
        report.invalid += snapshot.invalid;

        self.state.update(|s| {
            s.last_sync_timestamp = started;
            s.last_full_sync = started;
            s.last_error = None;
            s.phase = SyncPhase::Idle;
        });
        self.persist_metadata().await;

        info!(
            created = report.created,
            updated = report.updated,
            hidden = report.hidden,
            invalid = report.invalid,
            "Remote library merged"
        );
        Ok(report)
    }

    /// Merges documents of one collection updated after `since_ms`.
    pub async fn catch_up(&self, collection: Collection, since_ms: i64) -> SyncResult<MergeReport> {
        let user_id = self.require_user().await?;
        let started = self.clock.now_ms();

        let (docs, invalid) = self
            .download_collection(&user_id, collection, Some(since_ms))
            .await?;
        let mut report = self.applier.apply(&docs).await;
        report.invalid += invalid;

        self.state
            .update(|s| s.last_sync_timestamp = s.last_sync_timestamp.max(started));
        self.persist_metadata().await;

        info!(
            collection = %collection,
            since = since_ms,
            changes = report.changes(),
            "Catch-up merged"
        );
        Ok(report)
    }

    // =========================================================================
    // Upload
    // =========================================================================

    /// Uploads a complete local snapshot in ceiling-sized batches.
    ///
    /// Every document is merged with its current remote copy first, so an
    /// upload never regresses reading progress recorded by another device and
    /// never revives a remote delete.
    pub async fn upload_full(&self, user_id: &str, snapshot: &LocalSnapshot) -> SyncResult<usize> {
        let started = self.clock.now_ms();
        info!(user_id = %user_id, documents = snapshot.document_count(), "Uploading local library");

        let (remote_docs, _) = self
            .download_collection(user_id, Collection::Manga, None)
            .await?;
        let remote_manga: HashMap<String, MangaDocument> = remote_docs
            .into_iter()
            .filter_map(|doc| match doc {
                RemoteDocument::Manga(m) => Some((m.id.clone(), m)),
                _ => None,
            })
            .collect();

        let updated_at = self.clock.now_ms();
        let mut ops = manga_upload_ops(snapshot, &remote_manga, updated_at);

        let others: Vec<LibraryEntity> = snapshot
            .categories
            .iter()
            .cloned()
            .map(LibraryEntity::Category)
            .chain(snapshot.history.iter().cloned().map(LibraryEntity::History))
            .chain(snapshot.settings.iter().cloned().map(LibraryEntity::Settings))
            .collect();
        let refs: Vec<&LibraryEntity> = others.iter().collect();
        let built = match self.merged_ops(user_id, &refs, updated_at).await {
            Ok(built) => built,
            Err(e) => {
                if e.is_auth_error() {
                    self.suspend_for_auth(&e);
                } else {
                    self.record_error(&e);
                }
                return Err(e);
            }
        };
        for (entity, result) in others.iter().zip(built) {
            match result {
                Ok(op) => ops.push(op),
                Err(e) => warn!(id = entity.id(), error = %e, "Skipping entity in full upload"),
            }
        }

        for op in &mut ops {
            op.stamp_writer(&self.device_id);
        }
        let ceiling = self.batch_ceiling();
        let mut written = 0;

        for chunk in ops.chunks(ceiling) {
            for op in chunk {
                self.echo.record(op.path(user_id), op.updated_at);
            }
            let batch = WriteBatch {
                user_id: user_id.to_string(),
                ops: chunk.to_vec(),
            };
            if let Err(e) = self.commit_with_backoff(batch).await {
                if e.is_auth_error() {
                    self.suspend_for_auth(&e);
                } else {
                    self.record_error(&e);
                }
                warn!(written, remaining = ops.len() - written, error = %e, "Full upload interrupted");
                return Err(e);
            }
            written += chunk.len();
        }

        self.state.update(|s| {
            s.last_full_sync = started;
            s.last_sync_timestamp = s.last_sync_timestamp.max(started);
            s.last_error = None;
        });
        self.persist_metadata().await;

        info!(written, "Full upload complete");
        Ok(written)
    }

    /// Uploads everything in the local library for the signed-in user.
    pub async fn upload_local_library(&self) -> SyncResult<usize> {
        let user_id = self.require_user().await?;
        let snapshot = LocalSnapshot::collect(self.local.as_ref()).await?;
        self.upload_full(&user_id, &snapshot).await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops timers and blocks flushing. The queue is untouched.
    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.update(|s| {
            s.is_paused = true;
            s.phase = SyncPhase::Paused;
        });
        self.timers.send_modify(|t| t.running = false);
        info!("Sync paused");
    }

    pub fn resume(&self) {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        self.state.update(|s| {
            s.is_paused = false;
            s.phase = if s.last_error.is_some() { SyncPhase::Error } else { SyncPhase::Idle };
        });
        self.timers.send_modify(|t| t.running = true);
        info!("Sync resumed");
    }

    /// Switches the periodic flush on (foreground) or off (background).
    pub fn set_foreground(&self, foreground: bool) {
        self.timers.send_modify(|t| t.foreground = foreground);
        debug!(foreground, "Foreground state changed");
    }

    /// Drops every pending event.
    pub async fn clear_queue(&self) {
        self.queue.clear().await;
        self.state.update(|s| s.pending_count = 0);
        self.persist_metadata().await;
    }

    /// Forgets everything tied to the signed-out user.
    pub async fn logout(&self) {
        // Cancels any pending debounce.
        self.timers.send_modify(|_| {});
        self.queue.clear().await;
        if let Err(e) = self.storage.clear_metadata().await {
            warn!(error = %e, "Failed to clear sync metadata");
        }
        self.echo.clear();
        self.auth_suspended.store(false, Ordering::SeqCst);
        *self.retry_guard() = None;
        self.state.reset();
        info!("Sync state cleared on logout");
    }

    /// Lifts an auth suspension after the bridge reported a fresh session.
    pub fn resume_auth(&self) {
        if self.auth_suspended.swap(false, Ordering::SeqCst) {
            let paused = self.is_paused();
            self.state.update(|s| {
                s.needs_reauth = false;
                s.last_error = None;
                s.phase = if paused { SyncPhase::Paused } else { SyncPhase::Idle };
            });
            info!("Session renewed, flushing resumes");
        }
    }

    /// Publishes the queue's pending count.
    pub fn note_pending(&self, count: usize) {
        self.state.update(|s| s.pending_count = count);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// User id of the current session.
    pub async fn current_user(&self) -> Option<String> {
        self.auth.current_session().await.map(|s| s.user_id)
    }

    async fn require_user(&self) -> SyncResult<String> {
        self.current_user().await.ok_or(SyncError::NoUser)
    }

    fn suspend_for_auth(&self, err: &SyncError) {
        self.auth_suspended.store(true, Ordering::SeqCst);
        self.state.update(|s| {
            s.needs_reauth = true;
            s.is_syncing = false;
            s.last_error = Some(err.to_string());
            s.phase = SyncPhase::Error;
        });
        warn!(error = %err, "Remote rejected credential, flushing suspended");
    }

    fn record_error(&self, err: &SyncError) {
        self.state.update(|s| {
            s.last_error = Some(err.to_string());
            s.phase = SyncPhase::Error;
        });
        error!(error = %err, "Sync operation failed");
    }

    async fn persist_metadata(&self) {
        let state = self.state.snapshot();
        let metadata = SyncMetadata {
            last_sync_timestamp: state.last_sync_timestamp,
            last_full_sync: state.last_full_sync,
            pending_events: self.queue.len().await,
        };
        if let Err(e) = self.storage.save_metadata(&metadata).await {
            warn!(error = %e, "Failed to persist sync metadata");
        }
    }

    fn retry_guard(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.retry_not_before
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("paused", &self.is_paused())
            .field("auth_suspended", &self.is_auth_suspended())
            .field("syncing", &self.syncing.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Manga writes for a full upload, stamped with `updated_at`.
fn manga_upload_ops(
    snapshot: &LocalSnapshot,
    remote_manga: &HashMap<String, MangaDocument>,
    updated_at: i64,
) -> Vec<WriteOp> {
    let mut ops = Vec::with_capacity(snapshot.document_count());

    for (manga, chapters) in &snapshot.manga {
        if let Err(e) = validate_entity_id("manga_id", &manga.id) {
            warn!(id = %manga.id, error = %e, "Skipping manga with invalid id");
            continue;
        }
        let mut doc = merge_manga_up(manga, chapters, remote_manga.get(&manga.id));
        doc.updated_at = updated_at;
        match serde_json::to_value(&doc) {
            Ok(fields) => ops.push(WriteOp {
                collection: Collection::Manga,
                document_id: manga.id.clone(),
                fields,
                updated_at,
            }),
            Err(e) => warn!(id = %manga.id, error = %e, "Skipping unserializable manga"),
        }
    }

    ops
}

// =============================================================================
// Tests
// =============================================================================
