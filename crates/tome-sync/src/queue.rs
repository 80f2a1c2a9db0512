//! # Event Queue
//!
//! The deduplicated, priority-ordered set of pending outbound events.
//!
//! ## Queue Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         EventQueue                                      │
//! │                                                                         │
//! │   key = "entity_type:entity_id"     (at most one event per entity)     │
//! │                                                                         │
//! │   ┌──────────────────┬─────────┬──────────┬─────────┬─────────┐        │
//! │   │ key              │ version │ priority │ retries │ payload │        │
//! │   ├──────────────────┼─────────┼──────────┼─────────┼─────────┤        │
//! │   │ chapter:c-12     │ 1710... │ high     │ 0       │ {...}   │        │
//! │   │ manga:m-3        │ 1710... │ normal   │ 2       │ {...}   │        │
//! │   │ history:h-9      │ 1710... │ low      │ 0       │ {...}   │        │
//! │   └──────────────────┴─────────┴──────────┴─────────┴─────────┘        │
//! │                                                                         │
//! │   enqueue:  newer version replaces, older/equal version is stale       │
//! │   dequeue:  high → normal → low, then timestamp, then version          │
//! │             (non-destructive: events stay until acked)                 │
//! │   every mutation rewrites the persisted snapshot                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Semantics
//! Persistence errors are logged and swallowed. The in-memory set is
//! authoritative for the lifetime of the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tome_core::validation::validate_event;
use tome_core::SyncEvent;
use tracing::{debug, info, warn};

use crate::clock::MonotonicClock;
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::persist::{QueueSnapshot, StoredQueue, SyncStorage};

// =============================================================================
// Outcomes
// =============================================================================

/// What `enqueue` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// No event was pending for the entity.
    Inserted,
    /// A pending event with a lower version was replaced.
    Replaced,
    /// A pending event already has an equal or higher version.
    Stale,
}

/// What `requeue_with_backoff` did with a failed event.
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueOutcome {
    /// The event stays queued; retry no sooner than `delay`.
    Retrying { retry_count: u32, delay: Duration },
    /// The event was removed and will not be retried.
    PermanentFailure(SyncEvent),
    /// No pending event has this id (acked or replaced meanwhile).
    NotFound,
}

/// Retry limits applied across flushes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total write attempts per event, the first one included.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt following `retry_count` failures.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(32) as i32;
        let ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_delay.as_millis() as f64) as u64)
    }
}

impl From<&SyncSettings> for RetryPolicy {
    fn from(settings: &SyncSettings) -> Self {
        RetryPolicy {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_backoff_ms),
            multiplier: settings.backoff_multiplier,
            max_delay: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&SyncSettings::default())
    }
}

// =============================================================================
// Event Queue
// =============================================================================

/// Pending outbound events. Share as `Arc<EventQueue>`.
pub struct EventQueue {
    /// Pending events by queue key.
    events: Mutex<HashMap<String, SyncEvent>>,

    /// Snapshot persistence.
    storage: SyncStorage,

    /// Version source for migrated legacy events.
    clock: Arc<MonotonicClock>,

    /// Capacity in distinct keys.
    max_size: usize,

    /// Cross-flush retry limits.
    retry: RetryPolicy,

    /// Pending count; every mutation notifies subscribers.
    pending_tx: watch::Sender<usize>,
}

impl EventQueue {
    /// Creates an empty queue. Call [`EventQueue::restore`] to load the
    /// persisted snapshot.
    pub fn new(
        storage: SyncStorage,
        clock: Arc<MonotonicClock>,
        max_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        let (pending_tx, _) = watch::channel(0);
        Self {
            events: Mutex::new(HashMap::new()),
            storage,
            clock,
            max_size,
            retry,
            pending_tx,
        }
    }

    /// Adds an event, replacing an older pending event for the same entity.
    ///
    /// ## Errors
    /// - [`SyncError::QueueFull`] when the queue is at capacity and no event
    ///   for this entity is pending
    /// - [`SyncError::InvalidPayload`] when the event's ids cannot be used
    pub async fn enqueue(&self, event: SyncEvent) -> SyncResult<EnqueueOutcome> {
        validate_event(&event).map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

        let key = event.key();
        let mut events = self.events.lock().await;

        let outcome = match events.get(&key) {
            Some(existing) if event.version <= existing.version => {
                debug!(
                    key = %key,
                    pending = existing.version,
                    incoming = event.version,
                    "Ignoring stale event"
                );
                return Ok(EnqueueOutcome::Stale);
            }
            Some(_) => EnqueueOutcome::Replaced,
            None if events.len() >= self.max_size => {
                return Err(SyncError::QueueFull {
                    max_size: self.max_size,
                });
            }
            None => EnqueueOutcome::Inserted,
        };

        debug!(key = %key, version = event.version, ?outcome, "Event queued");
        self.clock.observe(event.version);
        events.insert(key, event);

        self.persist(&events).await;
        Ok(outcome)
    }

    /// Returns up to `limit` pending events in drain order.
    ///
    /// Events remain queued until [`EventQueue::ack`] or a permanent failure
    /// removes them.
    pub async fn dequeue_batch(&self, limit: usize) -> Vec<SyncEvent> {
        let events = self.events.lock().await;
        let mut batch: Vec<SyncEvent> = events.values().cloned().collect();
        drop(events);

        batch.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.timestamp.cmp(&b.timestamp))
                .then(a.version.cmp(&b.version))
        });
        batch.truncate(limit);
        batch
    }

    /// Removes the events with the given ids. Returns how many were removed.
    ///
    /// An event that was replaced by a newer version in the meantime has a new
    /// id and is not removed.
    pub async fn ack(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }

        let mut events = self.events.lock().await;
        let before = events.len();
        events.retain(|_, ev| !ids.contains(&ev.id));
        let removed = before - events.len();

        if removed > 0 {
            debug!(removed, "Events acknowledged");
            self.persist(&events).await;
        }
        removed
    }

    /// Records a failed write attempt for an event.
    ///
    /// A retryable failure keeps the event while it has been attempted fewer
    /// than `max_retries` times; anything else removes it.
    pub async fn requeue_with_backoff(&self, id: &str, retryable: bool) -> RequeueOutcome {
        let mut events = self.events.lock().await;

        let Some(key) = events
            .iter()
            .find(|(_, ev)| ev.id == id)
            .map(|(k, _)| k.clone())
        else {
            return RequeueOutcome::NotFound;
        };

        let outcome = match events.get_mut(&key) {
            Some(event) if retryable && event.retry_count + 1 < self.retry.max_retries => {
                event.retry_count += 1;
                RequeueOutcome::Retrying {
                    retry_count: event.retry_count,
                    delay: self.retry.delay_for(event.retry_count),
                }
            }
            _ => match events.remove(&key) {
                Some(event) => {
                    warn!(
                        key = %key,
                        retry_count = event.retry_count,
                        retryable,
                        "Dropping event after final failed attempt"
                    );
                    RequeueOutcome::PermanentFailure(event)
                }
                None => return RequeueOutcome::NotFound,
            },
        };

        self.persist(&events).await;
        outcome
    }

    /// Returns the pending event for a queue key.
    pub async fn get(&self, key: &str) -> Option<SyncEvent> {
        self.events.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }

    /// Highest pending version (0 when empty).
    pub async fn max_version(&self) -> u64 {
        self.events
            .lock()
            .await
            .values()
            .map(|ev| ev.version)
            .max()
            .unwrap_or(0)
    }

    /// Drops every pending event, in memory and on disk.
    pub async fn clear(&self) {
        let mut events = self.events.lock().await;
        let dropped = events.len();
        events.clear();

        if let Err(e) = self.storage.clear_queue().await {
            warn!(error = %e, "Failed to clear persisted queue");
        }
        self.pending_tx.send_replace(0);
        info!(dropped, "Event queue cleared");
    }

    /// Watches the pending count. Every queue mutation notifies, even when
    /// the count is unchanged.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Loads the persisted snapshot into memory.
    ///
    /// Idempotent: events merge by key and version, so restoring twice (or
    /// after events were enqueued) never duplicates or downgrades anything.
    /// A legacy snapshot is migrated and rewritten in the current format.
    /// Returns the number of events inserted or upgraded.
    pub async fn restore(&self) -> usize {
        let stored = match self.storage.load_queue().await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to read queue snapshot, starting empty");
                return 0;
            }
        };

        let (incoming, migrated) = match stored {
            StoredQueue::Current(snapshot) => (snapshot.events, false),
            StoredQueue::Legacy(entries) => {
                let events = entries
                    .into_iter()
                    .filter_map(|entry| {
                        let key = format!("{}:{}", entry.entity_type, entry.entity_id);
                        match entry.into_event(self.clock.tick()) {
                            Ok(ev) => Some(ev),
                            Err(e) => {
                                warn!(key = %key, error = %e, "Skipping unreadable legacy entry");
                                None
                            }
                        }
                    })
                    .collect();
                (events, true)
            }
            StoredQueue::Empty => {
                info!("No queue snapshot to restore");
                return 0;
            }
        };

        let mut events = self.events.lock().await;
        let mut restored = 0;
        for event in incoming {
            self.clock.observe(event.version);
            let key = event.key();
            let newer = events
                .get(&key)
                .map_or(true, |existing| event.version > existing.version);
            if !newer {
                continue;
            }
            if !events.contains_key(&key) && events.len() >= self.max_size {
                warn!(key = %key, "Queue full while restoring, dropping event");
                continue;
            }
            events.insert(key, event);
            restored += 1;
        }

        if migrated || restored > 0 {
            self.persist(&events).await;
        } else {
            self.pending_tx.send_replace(events.len());
        }
        drop(events);

        if migrated {
            if let Err(e) = self.storage.delete_legacy().await {
                warn!(error = %e, "Failed to delete legacy queue snapshot");
            }
            info!(restored, "Migrated legacy queue snapshot");
        } else {
            info!(restored, "Queue snapshot restored");
        }

        restored
    }

    /// Writes the full snapshot and publishes the pending count.
    async fn persist(&self, events: &HashMap<String, SyncEvent>) {
        let snapshot = QueueSnapshot::new(
            self.clock.now_ms(),
            events.values().cloned().collect(),
        );
        if let Err(e) = self.storage.save_queue(&snapshot).await {
            warn!(error = %e, pending = events.len(), "Failed to persist queue snapshot");
        }
        self.pending_tx.send_replace(events.len());
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("max_size", &self.max_size)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{LEGACY_QUEUE_KEY, QUEUE_KEY};
    use tome_core::{EntityType, EventKind, Priority};
    use tome_store::{KvStore, MemoryKvStore};

    fn queue_with(kv: Arc<MemoryKvStore>, max_size: usize, max_retries: u32) -> EventQueue {
        EventQueue::new(
            SyncStorage::new(kv),
            Arc::new(MonotonicClock::new()),
            max_size,
            RetryPolicy {
                max_retries,
                ..RetryPolicy::default()
            },
        )
    }

    fn queue() -> EventQueue {
        queue_with(Arc::new(MemoryKvStore::new()), 100, 3)
    }

    fn event(ty: EntityType, id: &str, timestamp: i64, version: u64) -> SyncEvent {
        SyncEvent::new(
            ty,
            id,
            EventKind::Update,
            serde_json::json!({ "id": id }),
            timestamp,
            version,
        )
    }

    #[tokio::test]
    async fn test_dedup_keeps_newest_version() {
        let q = queue();
        let first = event(EntityType::Chapter, "c1", 10, 1);
        let second = event(EntityType::Chapter, "c1", 20, 2);
        let second_id = second.id.clone();

        assert_eq!(q.enqueue(first).await.unwrap(), EnqueueOutcome::Inserted);
        assert_eq!(q.enqueue(second).await.unwrap(), EnqueueOutcome::Replaced);
        assert_eq!(
            q.enqueue(event(EntityType::Chapter, "c1", 30, 2)).await.unwrap(),
            EnqueueOutcome::Stale
        );
        assert_eq!(
            q.enqueue(event(EntityType::Chapter, "c1", 30, 1)).await.unwrap(),
            EnqueueOutcome::Stale
        );

        assert_eq!(q.len().await, 1);
        assert_eq!(q.get("chapter:c1").await.unwrap().id, second_id);
    }

    #[tokio::test]
    async fn test_priority_then_timestamp_order() {
        let q = queue();
        q.enqueue(event(EntityType::History, "h1", 1, 1)).await.unwrap();
        q.enqueue(event(EntityType::Manga, "m2", 5, 2)).await.unwrap();
        q.enqueue(event(EntityType::Manga, "m1", 3, 3)).await.unwrap();
        q.enqueue(event(EntityType::Chapter, "c1", 9, 4)).await.unwrap();

        let keys: Vec<String> = q.dequeue_batch(10).await.iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec!["chapter:c1", "manga:m1", "manga:m2", "history:h1"]);

        let limited = q.dequeue_batch(2).await;
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].priority, Priority::High);
        // Non-destructive
        assert_eq!(q.len().await, 4);
    }

    #[tokio::test]
    async fn test_queue_full_for_new_key_only() {
        let q = queue_with(Arc::new(MemoryKvStore::new()), 2, 3);
        q.enqueue(event(EntityType::Manga, "a", 1, 1)).await.unwrap();
        q.enqueue(event(EntityType::Manga, "b", 1, 2)).await.unwrap();

        let err = q.enqueue(event(EntityType::Manga, "c", 1, 3)).await.unwrap_err();
        assert!(err.is_capacity_error());

        // Replacing an existing key is still allowed at capacity
        assert_eq!(
            q.enqueue(event(EntityType::Manga, "a", 2, 4)).await.unwrap(),
            EnqueueOutcome::Replaced
        );
    }

    #[tokio::test]
    async fn test_ack_removes_only_given_ids() {
        let q = queue();
        let a = event(EntityType::Manga, "a", 1, 1);
        let a_id = a.id.clone();
        q.enqueue(a).await.unwrap();
        q.enqueue(event(EntityType::Manga, "b", 1, 2)).await.unwrap();

        assert_eq!(q.ack(&[a_id.clone()]).await, 1);
        assert_eq!(q.ack(&[a_id]).await, 0);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_ack_does_not_remove_replacement() {
        let q = queue();
        let old = event(EntityType::Chapter, "c1", 1, 1);
        let old_id = old.id.clone();
        q.enqueue(old).await.unwrap();
        q.enqueue(event(EntityType::Chapter, "c1", 2, 2)).await.unwrap();

        assert_eq!(q.ack(&[old_id]).await, 0);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_backoff_bound() {
        let q = queue(); // max_retries = 3
        let ev = event(EntityType::Manga, "m1", 1, 1);
        let id = ev.id.clone();
        q.enqueue(ev).await.unwrap();

        // Attempt 1 and 2 fail and are retried, attempt 3 is final
        assert!(matches!(
            q.requeue_with_backoff(&id, true).await,
            RequeueOutcome::Retrying { retry_count: 1, .. }
        ));
        assert!(matches!(
            q.requeue_with_backoff(&id, true).await,
            RequeueOutcome::Retrying { retry_count: 2, .. }
        ));
        assert!(matches!(
            q.requeue_with_backoff(&id, true).await,
            RequeueOutcome::PermanentFailure(_)
        ));
        assert!(q.is_empty().await);
        assert_eq!(q.requeue_with_backoff(&id, true).await, RequeueOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_non_retryable_is_dropped_immediately() {
        let q = queue();
        let ev = event(EntityType::Manga, "m1", 1, 1);
        let id = ev.id.clone();
        q.enqueue(ev).await.unwrap();

        assert!(matches!(
            q.requeue_with_backoff(&id, false).await,
            RequeueOutcome::PermanentFailure(_)
        ));
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_requeue_unknown_id_leaves_snapshot_alone() {
        let kv = Arc::new(MemoryKvStore::new());
        let q = queue_with(kv.clone(), 100, 3);

        assert_eq!(q.requeue_with_backoff("missing", true).await, RequeueOutcome::NotFound);
        assert!(kv.get(QUEUE_KEY).await.unwrap().is_none());
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            multiplier: 3.0,
            max_delay: Duration::from_secs(15),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for(3), Duration::from_secs(9));
        assert_eq!(policy.delay_for(4), Duration::from_secs(15));
        assert_eq!(policy.delay_for(30), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_durability_roundtrip() {
        let kv = Arc::new(MemoryKvStore::new());
        let q = queue_with(kv.clone(), 100, 3);
        q.enqueue(event(EntityType::Chapter, "c1", 1, 1)).await.unwrap();
        q.enqueue(event(EntityType::Manga, "m1", 2, 2)).await.unwrap();
        let before = q.dequeue_batch(10).await;

        let restarted = queue_with(kv, 100, 3);
        assert_eq!(restarted.restore().await, 2);
        assert_eq!(restarted.dequeue_batch(10).await, before);

        // Idempotent
        assert_eq!(restarted.restore().await, 0);
        assert_eq!(restarted.len().await, 2);
    }

    #[tokio::test]
    async fn test_restore_keeps_newer_in_memory_event() {
        let kv = Arc::new(MemoryKvStore::new());
        let q = queue_with(kv.clone(), 100, 3);
        q.enqueue(event(EntityType::Manga, "m1", 1, 1)).await.unwrap();

        let restarted = queue_with(kv, 100, 3);
        let fresh = event(EntityType::Manga, "m1", 5, 50);
        let fresh_id = fresh.id.clone();
        restarted.enqueue(fresh).await.unwrap();

        assert_eq!(restarted.restore().await, 0);
        assert_eq!(restarted.get("manga:m1").await.unwrap().id, fresh_id);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_restores_empty() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put(QUEUE_KEY, "][").await.unwrap();
        let q = queue_with(kv, 100, 3);
        assert_eq!(q.restore().await, 0);
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_legacy_snapshot_migrated() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.put(
            LEGACY_QUEUE_KEY,
            r#"[
                {"type":"chapter","entityId":"c1","data":{"id":"c1"}},
                {"type":"bogus","entityId":"x","data":{}},
                {"type":"manga","entityId":"m1","data":{"id":"m1"}}
            ]"#,
        )
        .await
        .unwrap();

        let q = queue_with(kv.clone(), 100, 3);
        assert_eq!(q.restore().await, 2);

        let first = &q.dequeue_batch(10).await[0];
        assert_eq!(first.key(), "chapter:c1");
        assert_eq!(first.kind, EventKind::Update);
        assert_eq!(first.priority, Priority::High);

        assert!(kv.get(LEGACY_QUEUE_KEY).await.unwrap().is_none());
        assert!(kv.get(QUEUE_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_swallowed() {
        let kv = Arc::new(MemoryKvStore::new());
        let q = queue_with(kv.clone(), 100, 3);
        kv.set_fail_writes(true);

        assert_eq!(
            q.enqueue(event(EntityType::Manga, "m1", 1, 1)).await.unwrap(),
            EnqueueOutcome::Inserted
        );
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear_and_subscribe() {
        let kv = Arc::new(MemoryKvStore::new());
        let q = queue_with(kv.clone(), 100, 3);
        let mut rx = q.subscribe();

        q.enqueue(event(EntityType::Manga, "m1", 1, 1)).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);

        q.clear().await;
        assert_eq!(*rx.borrow_and_update(), 0);
        assert!(kv.get(QUEUE_KEY).await.unwrap().is_none());
    }
}
