//! # Remote Document Store
//!
//! The multi-device store the engine syncs with, seen as a set of per-user
//! document collections.
//!
//! ```text
//! users/{uid}/manga/{mangaId}        MangaDocument (chapters embedded)
//! users/{uid}/categories/{id}        CategoryDocument
//! users/{uid}/history/{id}           HistoryDocument
//! users/{uid}/settings/{id}          SettingsDocument
//! ```
//!
//! Every write is a field-level merge: nested objects merge key by key, so
//! two devices patching different chapters of one manga never overwrite each
//! other. A batch commits atomically and holds at most
//! [`RemoteStore::max_batch_operations`] writes.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tome_core::{Collection, DocumentPatch};

use crate::error::SyncResult;

// =============================================================================
// Writes
// =============================================================================

/// One merge write into a document.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub collection: Collection,
    pub document_id: String,
    /// JSON object deep-merged into the stored document.
    pub fields: Value,
    /// `updated_at` stamped into `fields`, remembered for echo suppression.
    pub updated_at: i64,
}

/// Field naming the device that wrote a document last.
pub const UPDATED_BY_FIELD: &str = "updated_by";

impl WriteOp {
    pub fn path(&self, user_id: &str) -> String {
        self.collection.document_path(user_id, &self.document_id)
    }

    /// Marks the write as coming from `device_id`.
    pub fn stamp_writer(&mut self, device_id: &str) {
        if let Some(fields) = self.fields.as_object_mut() {
            fields.insert(UPDATED_BY_FIELD.to_string(), Value::from(device_id));
        }
    }
}

impl RawDocument {
    /// Device that wrote the document last, when recorded.
    pub fn written_by(&self) -> Option<&str> {
        self.data.get(UPDATED_BY_FIELD).and_then(Value::as_str)
    }

    /// `updated_at` as stored (0 when absent).
    pub fn updated_at(&self) -> i64 {
        self.data.get("updated_at").and_then(Value::as_i64).unwrap_or(0)
    }
}

impl From<DocumentPatch> for WriteOp {
    fn from(patch: DocumentPatch) -> Self {
        WriteOp {
            collection: patch.collection,
            document_id: patch.document_id,
            fields: patch.fields,
            updated_at: patch.updated_at,
        }
    }
}

/// An atomic group of writes for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    pub user_id: String,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

// =============================================================================
// Reads
// =============================================================================

/// Sort key for collection queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    /// `updated_at` ascending.
    UpdatedAt,
    /// `last_read` descending (most recent history first).
    LastReadDesc,
}

/// Collection query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteQuery {
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    /// Only documents whose `updated_at` is strictly greater.
    pub modified_after: Option<i64>,
}

impl RemoteQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(ms: i64) -> Self {
        Self {
            order_by: Some(OrderBy::UpdatedAt),
            modified_after: Some(ms),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn ordered_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }
}

/// A document as stored, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub data: Value,
}

/// One entry of a realtime change batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    /// The document was created or modified.
    Upserted(RawDocument),
    /// The document was removed outright (soft deletes arrive as `Upserted`).
    Removed { id: String },
}

/// Realtime change batches for one collection. Ends or yields an error when
/// the listener is lost.
pub type ChangeStream = BoxStream<'static, SyncResult<Vec<RemoteChange>>>;

// =============================================================================
// Remote Store
// =============================================================================

/// Client for the remote document store.
///
/// Implementations report transient failures as
/// [`SyncError::RemoteUnavailable`](crate::SyncError::RemoteUnavailable),
/// rejected credentials as
/// [`SyncError::Unauthenticated`](crate::SyncError::Unauthenticated) and
/// permanent rejections as
/// [`SyncError::RemoteRejected`](crate::SyncError::RemoteRejected).
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Largest number of writes accepted in one batch.
    fn max_batch_operations(&self) -> usize;

    /// Commits all writes atomically.
    async fn commit(&self, batch: WriteBatch) -> SyncResult<()>;

    /// Reads documents of one collection.
    async fn query(
        &self,
        user_id: &str,
        collection: Collection,
        query: RemoteQuery,
    ) -> SyncResult<Vec<RawDocument>>;

    /// Reads the current copies of specific documents. Missing ids are
    /// left out of the result.
    async fn fetch(
        &self,
        user_id: &str,
        collection: Collection,
        ids: &[String],
    ) -> SyncResult<Vec<RawDocument>>;

    /// Opens a standing listener on one collection.
    async fn subscribe(&self, user_id: &str, collection: Collection) -> SyncResult<ChangeStream>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stamp_writer() {
        let mut op = WriteOp {
            collection: Collection::Manga,
            document_id: "m1".into(),
            fields: json!({ "title": "A", "updated_at": 5 }),
            updated_at: 5,
        };
        op.stamp_writer("device-a");

        let doc = RawDocument {
            id: "m1".into(),
            data: op.fields,
        };
        assert_eq!(doc.written_by(), Some("device-a"));
        assert_eq!(doc.updated_at(), 5);
    }

    #[test]
    fn test_unstamped_document() {
        let doc = RawDocument {
            id: "m1".into(),
            data: json!({ "title": "A" }),
        };
        assert_eq!(doc.written_by(), None);
        assert_eq!(doc.updated_at(), 0);
    }
}
