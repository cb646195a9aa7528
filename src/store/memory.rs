//! In-process backing store.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::{BackingStore, StoreError};

/// A backing store living in the current process.
///
/// Cloning is cheap and clones share the same maps, so several limiters (or a
/// [`StoreServer`](super::StoreServer)) can coordinate through one store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: Arc<DashMap<String, u64>>,
    locks: Arc<DashMap<String, ()>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no values are stored.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether the named lock is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.values.get(key).map(|v| *v))
    }

    async fn set(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn lock(&self, key: &str) -> Result<bool, StoreError> {
        // The entry API holds the shard write lock, making this a test-and-set.
        let acquired = match self.locks.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        };
        trace!(key = %key, acquired, "Lock attempt");
        Ok(acquired)
    }

    async fn unlock(&self, key: &str) -> Result<(), StoreError> {
        self.locks.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_absent_key() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryStore::new();
        store.set("a", 7).await.unwrap();
        store.set("a", 9).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(9));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_is_test_and_set() {
        let store = MemoryStore::new();
        assert!(store.lock("l").await.unwrap());
        assert!(!store.lock("l").await.unwrap());
        assert!(store.is_locked("l"));

        store.unlock("l").await.unwrap();
        assert!(!store.is_locked("l"));
        assert!(store.lock("l").await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_is_idempotent() {
        let store = MemoryStore::new();
        store.unlock("never-held").await.unwrap();
        store.unlock("never-held").await.unwrap();
        assert!(store.lock("never-held").await.unwrap());
    }

    #[tokio::test]
    async fn test_locks_do_not_touch_values() {
        let store = MemoryStore::new();
        store.lock("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("shared", 1).await.unwrap();
        assert_eq!(other.get("shared").await.unwrap(), Some(1));
        assert!(other.lock("x").await.unwrap());
        assert!(!store.lock("x").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_lock_has_single_winner() {
        let store = MemoryStore::new();
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.lock("race").await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
