//! # Persisted Engine State
//!
//! Versioned records the engine keeps in its [`KvStore`].
//!
//! ## Keys
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tome.sync.queue.v2   { "format": 2, "saved_at": ms, "events": [...] } │
//! │  tome.sync.meta.v1    { last_sync_timestamp, last_full_sync,           │
//! │                         pending_events }                               │
//! │  tome.sync.queue.v1   [ { "type", "entityId", "data" } ]   (legacy)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every write replaces the whole value. Unreadable values are reported as
//! absent with a warning; they are never fatal.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tome_core::{EntityType, EventKind, SyncEvent};
use tome_store::KvStore;
use tracing::{debug, warn};

use crate::clock::Stamp;
use crate::error::SyncResult;

/// Current queue snapshot key.
pub const QUEUE_KEY: &str = "tome.sync.queue.v2";

/// Legacy queue snapshot key, migrated on restore.
pub const LEGACY_QUEUE_KEY: &str = "tome.sync.queue.v1";

/// Sync metadata key.
pub const METADATA_KEY: &str = "tome.sync.meta.v1";

/// Format number written into queue snapshots.
pub const SNAPSHOT_FORMAT: u32 = 2;

// =============================================================================
// Records
// =============================================================================

/// Serialized form of every pending event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub format: u32,
    pub saved_at: i64,
    pub events: Vec<SyncEvent>,
}

impl QueueSnapshot {
    pub fn new(saved_at: i64, events: Vec<SyncEvent>) -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            saved_at,
            events,
        }
    }
}

/// One entry of the legacy snapshot format.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEntry {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl LegacyEntry {
    /// Converts to a current event. Legacy entries carried no kind, so they
    /// become updates with the type's default priority.
    pub fn into_event(self, stamp: Stamp) -> SyncResult<SyncEvent> {
        let entity_type: EntityType = self.entity_type.parse()?;
        Ok(SyncEvent::new(
            entity_type,
            self.entity_id,
            EventKind::Update,
            self.data,
            stamp.timestamp_ms,
            stamp.version,
        ))
    }
}

/// Persisted sync bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncMetadata {
    #[serde(default)]
    pub last_sync_timestamp: i64,
    #[serde(default)]
    pub last_full_sync: i64,
    #[serde(default)]
    pub pending_events: usize,
}

/// Result of reading the queue keys.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredQueue {
    /// A current-format snapshot.
    Current(QueueSnapshot),
    /// Only a legacy snapshot exists.
    Legacy(Vec<LegacyEntry>),
    /// Nothing usable is stored.
    Empty,
}

// =============================================================================
// Storage
// =============================================================================

/// Typed access to the engine's keys.
#[derive(Clone)]
pub struct SyncStorage {
    kv: Arc<dyn KvStore>,
}

impl SyncStorage {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Reads the queue snapshot, falling back to the legacy key.
    pub async fn load_queue(&self) -> SyncResult<StoredQueue> {
        if let Some(raw) = self.kv.get(QUEUE_KEY).await? {
            match serde_json::from_str::<QueueSnapshot>(&raw) {
                Ok(snapshot) if snapshot.format == SNAPSHOT_FORMAT => {
                    return Ok(StoredQueue::Current(snapshot));
                }
                Ok(snapshot) => {
                    warn!(format = snapshot.format, "Unknown queue snapshot format, discarding");
                    return Ok(StoredQueue::Empty);
                }
                Err(e) => {
                    warn!(error = %e, "Corrupt queue snapshot, discarding");
                    return Ok(StoredQueue::Empty);
                }
            }
        }

        if let Some(raw) = self.kv.get(LEGACY_QUEUE_KEY).await? {
            match serde_json::from_str::<Vec<LegacyEntry>>(&raw) {
                Ok(entries) => {
                    debug!(entries = entries.len(), "Found legacy queue snapshot");
                    return Ok(StoredQueue::Legacy(entries));
                }
                Err(e) => {
                    warn!(error = %e, "Corrupt legacy queue snapshot, discarding");
                    self.kv.delete(LEGACY_QUEUE_KEY).await?;
                }
            }
        }

        Ok(StoredQueue::Empty)
    }

    /// Replaces the queue snapshot.
    pub async fn save_queue(&self, snapshot: &QueueSnapshot) -> SyncResult<()> {
        let raw = serde_json::to_string(snapshot)?;
        self.kv.put(QUEUE_KEY, &raw).await?;
        Ok(())
    }

    /// Removes the queue snapshot (both formats).
    pub async fn clear_queue(&self) -> SyncResult<()> {
        self.kv.delete(QUEUE_KEY).await?;
        self.kv.delete(LEGACY_QUEUE_KEY).await?;
        Ok(())
    }

    /// Removes the legacy snapshot once migrated.
    pub async fn delete_legacy(&self) -> SyncResult<()> {
        self.kv.delete(LEGACY_QUEUE_KEY).await?;
        Ok(())
    }

    /// Reads sync metadata. Missing or unreadable metadata reads as zeroed.
    pub async fn load_metadata(&self) -> SyncResult<SyncMetadata> {
        let Some(raw) = self.kv.get(METADATA_KEY).await? else {
            return Ok(SyncMetadata::default());
        };

        Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(error = %e, "Corrupt sync metadata, resetting");
            SyncMetadata::default()
        }))
    }

    /// Replaces sync metadata.
    pub async fn save_metadata(&self, metadata: &SyncMetadata) -> SyncResult<()> {
        let raw = serde_json::to_string(metadata)?;
        self.kv.put(METADATA_KEY, &raw).await?;
        Ok(())
    }

    /// Removes sync metadata.
    pub async fn clear_metadata(&self) -> SyncResult<()> {
        self.kv.delete(METADATA_KEY).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SyncStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncStorage").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tome_store::MemoryKvStore;

    fn storage() -> (Arc<MemoryKvStore>, SyncStorage) {
        let kv = Arc::new(MemoryKvStore::new());
        (kv.clone(), SyncStorage::new(kv))
    }

    #[tokio::test]
    async fn test_empty_store() {
        let (_, storage) = storage();
        assert_eq!(storage.load_queue().await.unwrap(), StoredQueue::Empty);
        assert_eq!(storage.load_metadata().await.unwrap(), SyncMetadata::default());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_reads_empty() {
        let (kv, storage) = storage();
        kv.put(QUEUE_KEY, "{not json").await.unwrap();
        assert_eq!(storage.load_queue().await.unwrap(), StoredQueue::Empty);
    }

    #[tokio::test]
    async fn test_legacy_snapshot_detected() {
        let (kv, storage) = storage();
        kv.put(
            LEGACY_QUEUE_KEY,
            r#"[{"type":"chapter","entityId":"c1","data":{"id":"c1"}}]"#,
        )
        .await
        .unwrap();

        let StoredQueue::Legacy(entries) = storage.load_queue().await.unwrap() else {
            panic!("expected legacy snapshot");
        };
        assert_eq!(entries[0].entity_type, "chapter");
        assert_eq!(entries[0].entity_id, "c1");
    }

    #[tokio::test]
    async fn test_metadata_roundtrip() {
        let (_, storage) = storage();
        let meta = SyncMetadata {
            last_sync_timestamp: 10,
            last_full_sync: 5,
            pending_events: 3,
        };
        storage.save_metadata(&meta).await.unwrap();
        assert_eq!(storage.load_metadata().await.unwrap(), meta);
    }

    #[test]
    fn test_legacy_entry_conversion() {
        let entry = LegacyEntry {
            entity_type: "history".into(),
            entity_id: "h1".into(),
            data: serde_json::Value::Null,
        };
        let event = entry
            .into_event(Stamp {
                timestamp_ms: 7,
                version: 8,
            })
            .unwrap();
        assert_eq!(event.kind, EventKind::Update);
        assert_eq!(event.priority, tome_core::Priority::Low);
        assert_eq!(event.version, 8);

        let unknown = LegacyEntry {
            entity_type: "comment".into(),
            entity_id: "x".into(),
            data: serde_json::Value::Null,
        };
        assert!(unknown.into_event(Stamp { timestamp_ms: 0, version: 1 }).is_err());
    }
}
