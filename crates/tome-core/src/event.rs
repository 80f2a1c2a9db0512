//! # Sync Events
//!
//! The unit of outbound work and the process-wide sync status.
//!
//! ## Event Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncEvent Lifecycle                              │
//! │                                                                         │
//! │  local write ──► ChangeCapture ──► (debounce) ──► EventQueue            │
//! │                                                      │                  │
//! │                    key = "entity_type:entity_id"     │                  │
//! │                    newer version replaces older      ▼                  │
//! │                                              dequeue_batch(limit)       │
//! │                                                      │                  │
//! │                            ┌─────────────────────────┼──────────────┐   │
//! │                            ▼                         ▼              ▼   │
//! │                          ack()              requeue(retryable)   drop   │
//! │                       (written)            retry_count += 1   (failed)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//! Events drain high → normal → low, then by ascending `timestamp`, then by
//! ascending `version`. `Priority` derives `Ord` in that order.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::CoreError;

// =============================================================================
// Entity Type
// =============================================================================

/// Synced entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Manga,
    Chapter,
    Category,
    Settings,
    History,
}

impl EntityType {
    /// Every synced entity type.
    pub const ALL: [EntityType; 5] = [
        EntityType::Manga,
        EntityType::Chapter,
        EntityType::Category,
        EntityType::Settings,
        EntityType::History,
    ];

    /// Returns the wire name (`"manga"`, `"chapter"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Manga => "manga",
            EntityType::Chapter => "chapter",
            EntityType::Category => "category",
            EntityType::Settings => "settings",
            EntityType::History => "history",
        }
    }

    /// Default drain priority for events of this type.
    ///
    /// Chapter events are explicit reading actions and go first.
    pub fn default_priority(&self) -> Priority {
        match self {
            EntityType::Chapter => Priority::High,
            EntityType::Manga | EntityType::Category => Priority::Normal,
            EntityType::History | EntityType::Settings => Priority::Low,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manga" => Ok(EntityType::Manga),
            "chapter" => Ok(EntityType::Chapter),
            "category" => Ok(EntityType::Category),
            "settings" => Ok(EntityType::Settings),
            "history" => Ok(EntityType::History),
            other => Err(CoreError::UnknownEntityType(other.to_string())),
        }
    }
}

// =============================================================================
// Event Kind / Priority
// =============================================================================

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// Drain priority. Declaration order is drain order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize, TS,
)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

// =============================================================================
// Sync Event
// =============================================================================

/// One intended change to a synced entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncEvent {
    /// Unique event id (UUID v4).
    pub id: String,

    /// Entity type.
    pub entity_type: EntityType,

    /// Entity id (unique within its type).
    pub entity_id: String,

    /// Create, update or delete.
    pub kind: EventKind,

    /// When the change was captured (epoch ms, monotonic per process).
    pub timestamp: i64,

    /// Drain priority.
    pub priority: Priority,

    /// Full entity snapshot. For deletes, the last known snapshot (may be null).
    pub payload: serde_json::Value,

    /// Failed write attempts so far.
    #[serde(default)]
    pub retry_count: u32,

    /// Local revision counter. Strictly increasing per process and seeded
    /// from wall-clock microseconds.
    pub version: u64,
}

impl SyncEvent {
    /// Creates a new event with a fresh id and the type's default priority.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        kind: EventKind,
        payload: serde_json::Value,
        timestamp: i64,
        version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            kind,
            timestamp,
            priority: entity_type.default_priority(),
            payload,
            retry_count: 0,
            version,
        }
    }

    /// Overrides the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Queue key (`entity_type:entity_id`).
    pub fn key(&self) -> String {
        event_key(self.entity_type, &self.entity_id)
    }

    /// Returns true if this event deletes its entity.
    pub fn is_delete(&self) -> bool {
        self.kind == EventKind::Delete
    }
}

/// Builds a queue key from its parts.
pub fn event_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{}:{}", entity_type, entity_id)
}

/// Formats an epoch-millisecond timestamp as RFC 3339 for logs and tooling.
///
/// Out-of-range values are printed as the raw number.
pub fn format_timestamp(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

// =============================================================================
// Sync State
// =============================================================================

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Flushing,
    Downloading,
    Paused,
    Error,
}

/// Process-wide sync status observed by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncState {
    /// Last successful flush or download (epoch ms, 0 = never).
    pub last_sync_timestamp: i64,

    /// A flush or download is in flight.
    pub is_syncing: bool,

    /// Sync is paused by the user.
    pub is_paused: bool,

    /// Events waiting in the queue.
    pub pending_count: usize,

    /// Last surfaced error, cleared by the next successful sync.
    pub last_error: Option<String>,

    /// Current phase.
    pub phase: SyncPhase,

    /// The remote rejected our credential; flush is suspended until the
    /// user signs in again.
    pub needs_reauth: bool,

    /// Last full download/upload (epoch ms, 0 = never).
    pub last_full_sync: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let mut ps = vec![Priority::Low, Priority::High, Priority::Normal];
        ps.sort();
        assert_eq!(ps, vec![Priority::High, Priority::Normal, Priority::Low]);
    }

    #[test]
    fn test_default_priorities() {
        assert_eq!(EntityType::Chapter.default_priority(), Priority::High);
        assert_eq!(EntityType::Manga.default_priority(), Priority::Normal);
        assert_eq!(EntityType::Category.default_priority(), Priority::Normal);
        assert_eq!(EntityType::History.default_priority(), Priority::Low);
        assert_eq!(EntityType::Settings.default_priority(), Priority::Low);
    }

    #[test]
    fn test_entity_type_roundtrip() {
        for ty in EntityType::ALL {
            assert_eq!(ty.as_str().parse::<EntityType>().unwrap(), ty);
        }
        assert!("comment".parse::<EntityType>().is_err());
    }

    #[test]
    fn test_event_key() {
        let ev = SyncEvent::new(
            EntityType::Chapter,
            "c-42",
            EventKind::Update,
            serde_json::Value::Null,
            1,
            1,
        );
        assert_eq!(ev.key(), "chapter:c-42");
        assert_eq!(ev.priority, Priority::High);
        assert_eq!(ev.retry_count, 0);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(format_timestamp(1_500), "1970-01-01T00:00:01.500Z");
    }

    #[test]
    fn test_event_serializes_snake_case() {
        let ev = SyncEvent::new(
            EntityType::History,
            "h1",
            EventKind::Delete,
            serde_json::Value::Null,
            5,
            9,
        );
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["entity_type"], "history");
        assert_eq!(json["kind"], "delete");
        assert_eq!(json["priority"], "low");
    }
}
