//! # Change Capture
//!
//! Turns local change notifications into queued [`SyncEvent`]s.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Change Capture                                  │
//! │                                                                         │
//! │  host DB ── ChangeSet ──► on_change() ─── suspended? ──► dropped       │
//! │                              │                                          │
//! │                              │ SyncEvent (stamped now, full snapshot)   │
//! │                              ▼                                          │
//! │                    ┌───────────────────────┐                            │
//! │                    │   CaptureWorker       │                            │
//! │                    │   debounce table      │   one entry per key,      │
//! │                    │   key → (event, due)  │   newest wins, due time   │
//! │                    └──────────┬────────────┘   pushed back on change   │
//! │                               │ due                                     │
//! │                               ▼                                         │
//! │                      EventQueue::enqueue                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Chapter and history changes wait longer than the rest: reading progress
//! moves page by page and only the last position matters.
//!
//! ## Suspension
//! While merged remote state is written locally, the resulting notifications
//! must not be captured (they would echo straight back). Holding a
//! [`SuspendGuard`] drops every notification that arrives meanwhile; the
//! check happens synchronously inside `on_change`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tome_core::{EventKind, LibraryEntity, SyncEvent};
use tracing::{debug, info, warn};

use crate::clock::MonotonicClock;
use crate::config::CaptureSettings;
use crate::error::{SyncError, SyncResult};
use crate::queue::EventQueue;

// =============================================================================
// Change Source
// =============================================================================

/// Entities touched by one local write, as snapshots after the write.
///
/// `deleted` carries the last snapshot of each removed entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub inserted: Vec<LibraryEntity>,
    pub modified: Vec<LibraryEntity>,
    pub deleted: Vec<LibraryEntity>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.modified.len() + self.deleted.len()
    }
}

/// Receiver of local change notifications. Called synchronously by the
/// source, so implementations must not block.
pub trait ChangeSink: Send + Sync {
    fn on_change(&self, changes: &ChangeSet);
}

/// Push-based notifications from the host database.
pub trait ChangeSource: Send + Sync {
    /// Registers a sink until the returned subscription is dropped.
    fn subscribe(&self, sink: Arc<dyn ChangeSink>) -> Subscription;
}

/// Keeps a [`ChangeSink`] registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

// =============================================================================
// Suspension
// =============================================================================

/// Shared suspension counter. Capture is suspended while any guard lives.
#[derive(Debug, Clone, Default)]
pub struct SuspendToken(Arc<AtomicUsize>);

impl SuspendToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends capture until the guard drops. Guards nest.
    pub fn suspend(&self) -> SuspendGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        SuspendGuard(self.0.clone())
    }

    pub fn is_suspended(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }
}

/// Resumes capture when dropped.
#[derive(Debug)]
pub struct SuspendGuard(Arc<AtomicUsize>);

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Capture Handle
// =============================================================================

enum CaptureCommand {
    Change(SyncEvent),
    FlushPending(oneshot::Sender<usize>),
    Discard(oneshot::Sender<usize>),
    PendingLen(oneshot::Sender<usize>),
    Shutdown,
}

/// Handle to the capture worker. Register it with a [`ChangeSource`].
#[derive(Clone)]
pub struct ChangeCapture {
    tx: mpsc::UnboundedSender<CaptureCommand>,
    suspend: SuspendToken,
    clock: Arc<MonotonicClock>,
}

impl ChangeCapture {
    /// Spawns the debounce worker on the current runtime.
    pub fn spawn(
        queue: Arc<EventQueue>,
        clock: Arc<MonotonicClock>,
        settings: CaptureSettings,
        suspend: SuspendToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = CaptureWorker {
            queue,
            settings,
            rx,
            pending: HashMap::new(),
        };
        tokio::spawn(worker.run());

        Self { tx, suspend, clock }
    }

    /// Registers this capture with a change source.
    pub fn attach(&self, source: &dyn ChangeSource) -> Subscription {
        source.subscribe(Arc::new(self.clone()))
    }

    /// Suspends capture until the guard drops.
    pub fn suspend(&self) -> SuspendGuard {
        self.suspend.suspend()
    }

    pub fn suspend_token(&self) -> &SuspendToken {
        &self.suspend
    }

    /// Enqueues every debounced event now. Returns how many were handed to
    /// the queue.
    pub async fn flush_pending(&self) -> SyncResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(CaptureCommand::FlushPending(reply))?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Drops every debounced event without queuing it. Returns how many were
    /// dropped.
    pub async fn discard_pending(&self) -> SyncResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(CaptureCommand::Discard(reply))?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Number of events waiting out their debounce delay.
    pub async fn pending_len(&self) -> SyncResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(CaptureCommand::PendingLen(reply))?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Stops the worker. Debounced events not yet queued are lost.
    pub fn shutdown(&self) {
        let _ = self.tx.send(CaptureCommand::Shutdown);
    }

    fn send(&self, command: CaptureCommand) -> SyncResult<()> {
        self.tx.send(command).map_err(|_| SyncError::ShuttingDown)
    }

    fn event_for(&self, entity: &LibraryEntity, kind: EventKind) -> Option<SyncEvent> {
        let stamp = self.clock.tick();

        let mut snapshot = entity.clone();
        if kind == EventKind::Delete && !snapshot.is_deleted() {
            snapshot.mark_deleted(snapshot.modified().max(stamp.timestamp_ms));
        }

        let payload = match snapshot.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(entity_id = entity.id(), error = %e, "Cannot capture change");
                return None;
            }
        };

        Some(SyncEvent::new(
            entity.entity_type(),
            entity.id(),
            kind,
            payload,
            stamp.timestamp_ms,
            stamp.version,
        ))
    }
}

impl ChangeSink for ChangeCapture {
    fn on_change(&self, changes: &ChangeSet) {
        if self.suspend.is_suspended() {
            debug!(changes = changes.len(), "Capture suspended, ignoring changes");
            return;
        }

        let tagged = changes
            .inserted
            .iter()
            .map(|e| (e, EventKind::Create))
            .chain(changes.modified.iter().map(|e| (e, EventKind::Update)))
            .chain(changes.deleted.iter().map(|e| (e, EventKind::Delete)));

        for (entity, kind) in tagged {
            if let Some(event) = self.event_for(entity, kind) {
                if self.tx.send(CaptureCommand::Change(event)).is_err() {
                    warn!("Capture worker stopped, change lost");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for ChangeCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeCapture")
            .field("suspended", &self.suspend.is_suspended())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Debounce Worker
// =============================================================================

struct Debounced {
    event: SyncEvent,
    due: Instant,
}

struct CaptureWorker {
    queue: Arc<EventQueue>,
    settings: CaptureSettings,
    rx: mpsc::UnboundedReceiver<CaptureCommand>,
    pending: HashMap<String, Debounced>,
}

impl CaptureWorker {
    async fn run(mut self) {
        debug!("Capture worker started");

        loop {
            let next_due = self.pending.values().map(|d| d.due).min();

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(CaptureCommand::Change(event)) => self.debounce(event),
                    Some(CaptureCommand::FlushPending(reply)) => {
                        let count = self.enqueue_where(|_| true).await;
                        let _ = reply.send(count);
                    }
                    Some(CaptureCommand::Discard(reply)) => {
                        let dropped = self.pending.len();
                        self.pending.clear();
                        if dropped > 0 {
                            debug!(dropped, "Debounced changes discarded");
                        }
                        let _ = reply.send(dropped);
                    }
                    Some(CaptureCommand::PendingLen(reply)) => {
                        let _ = reply.send(self.pending.len());
                    }
                    Some(CaptureCommand::Shutdown) | None => break,
                },
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let now = Instant::now();
                    self.enqueue_where(|d| d.due <= now).await;
                }
            }
        }

        if !self.pending.is_empty() {
            info!(dropped = self.pending.len(), "Capture worker stopped with debounced changes");
        }
        debug!("Capture worker stopped");
    }

    /// Records an event, replacing any pending one for the same entity.
    fn debounce(&mut self, mut event: SyncEvent) {
        let key = event.key();
        let due = Instant::now() + self.settings.delay_for(event.entity_type);

        if let Some(previous) = self.pending.get(&key) {
            // Still unsynced: an edit right after creation is a creation.
            if previous.event.kind == EventKind::Create && event.kind == EventKind::Update {
                event.kind = EventKind::Create;
            }
        }

        debug!(key = %key, kind = ?event.kind, "Change debounced");
        self.pending.insert(key, Debounced { event, due });
    }

    /// Moves matching entries into the queue. Returns how many were handed
    /// over.
    async fn enqueue_where(&mut self, ready: impl Fn(&Debounced) -> bool) -> usize {
        let keys: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, d)| ready(d))
            .map(|(k, _)| k.clone())
            .collect();

        let mut count = 0;
        for key in keys {
            let Some(entry) = self.pending.remove(&key) else {
                continue;
            };
            match self.queue.enqueue(entry.event).await {
                Ok(_) => count += 1,
                Err(e) if e.is_capacity_error() => {
                    warn!(key = %key, error = %e, "Queue full, dropping change");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Rejected captured change");
                }
            }
        }
        count
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::SyncStorage;
    use crate::queue::RetryPolicy;
    use crate::fixtures::{chapter, manga};
    use std::time::Duration;
    use tome_core::{EntityType, Priority};
    use tome_store::MemoryKvStore;

    fn setup() -> (Arc<EventQueue>, ChangeCapture) {
        let clock = Arc::new(MonotonicClock::new());
        let queue = Arc::new(EventQueue::new(
            SyncStorage::new(Arc::new(MemoryKvStore::new())),
            clock.clone(),
            100,
            RetryPolicy::default(),
        ));
        let capture = ChangeCapture::spawn(
            queue.clone(),
            clock,
            CaptureSettings::default(),
            SuspendToken::new(),
        );
        (queue, capture)
    }

    fn modified(entity: LibraryEntity) -> ChangeSet {
        ChangeSet {
            modified: vec![entity],
            ..ChangeSet::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_progress() {
        let (queue, capture) = setup();

        for page in 1..=5 {
            let mut c = chapter("c1", "m1", page);
            c.last_page_read = page as u32;
            capture.on_change(&modified(LibraryEntity::Chapter(c)));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(queue.is_empty().await);
        assert_eq!(capture.pending_len().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;

        let batch = queue.dequeue_batch(10).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].priority, Priority::High);
        assert_eq!(batch[0].payload["last_page_read"], 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_type_delay() {
        let (queue, capture) = setup();
        capture.on_change(&modified(LibraryEntity::Manga(manga("m1", 1))));
        capture.on_change(&modified(LibraryEntity::Chapter(chapter("c1", "m1", 1))));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(queue.len().await, 1);
        assert!(queue.get("manga:m1").await.is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspended_changes_are_dropped() {
        let (queue, capture) = setup();
        {
            let _guard = capture.suspend();
            capture.on_change(&modified(LibraryEntity::Manga(manga("m1", 1))));
        }
        assert_eq!(capture.flush_pending().await.unwrap(), 0);
        assert!(queue.is_empty().await);

        capture.on_change(&modified(LibraryEntity::Manga(manga("m1", 2))));
        assert_eq!(capture.flush_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_carries_soft_deleted_snapshot() {
        let (queue, capture) = setup();
        capture.on_change(&ChangeSet {
            deleted: vec![LibraryEntity::Manga(manga("m1", 1))],
            ..ChangeSet::default()
        });
        capture.flush_pending().await.unwrap();

        let event = queue.get("manga:m1").await.unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert_eq!(event.entity_type, EntityType::Manga);
        assert_eq!(event.payload["deleted"], true);
    }

    #[tokio::test]
    async fn test_update_after_create_stays_create() {
        let (queue, capture) = setup();
        capture.on_change(&ChangeSet {
            inserted: vec![LibraryEntity::Manga(manga("m1", 1))],
            ..ChangeSet::default()
        });
        capture.on_change(&modified(LibraryEntity::Manga(manga("m1", 2))));
        capture.flush_pending().await.unwrap();

        let event = queue.get("manga:m1").await.unwrap();
        assert_eq!(event.kind, EventKind::Create);
        assert_eq!(event.payload["modified"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_pending_never_reaches_queue() {
        let (queue, capture) = setup();
        capture.on_change(&modified(LibraryEntity::Manga(manga("m1", 1))));
        capture.on_change(&modified(LibraryEntity::Chapter(chapter("c1", "m1", 1))));

        assert_eq!(capture.discard_pending().await.unwrap(), 2);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(queue.is_empty().await);
        assert_eq!(capture.pending_len().await.unwrap(), 0);
    }

    #[test]
    fn test_guards_nest() {
        let token = SuspendToken::new();
        let outer = token.suspend();
        let inner = token.suspend();
        drop(inner);
        assert!(token.is_suspended());
        drop(outer);
        assert!(!token.is_suspended());
    }

    #[test]
    fn test_subscription_drop_unsubscribes() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = flag.clone();
        drop(Subscription::new(move || seen.store(true, Ordering::SeqCst)));
        assert!(flag.load(Ordering::SeqCst));
    }
}
