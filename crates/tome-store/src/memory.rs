//! # In-Memory Store
//!
//! [`KvStore`] over a `BTreeMap`, for tests and local emulation.
//!
//! Writes can be made to fail on demand to exercise the engine's
//! "log and continue" handling of persistence errors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::repository::KvStore;

/// In-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `put`/`delete` fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::QueryFailed("disk I/O error (simulated)".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let kv = MemoryKvStore::new();
        kv.put("k", "v").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        kv.delete("k").await.unwrap();
        assert!(kv.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_simulated_failure() {
        let kv = MemoryKvStore::new();
        kv.set_fail_writes(true);
        assert!(kv.put("k", "v").await.is_err());
        kv.set_fail_writes(false);
        assert!(kv.put("k", "v").await.is_ok());
    }
}
