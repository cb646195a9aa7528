//! Bounded spin-polling lock acquisition.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::store::{BackingStore, StoreError};

/// Acquires a store lock by polling it at a fixed interval.
///
/// There is no queue: whichever waiter polls first after a release wins, so
/// acquisition order under contention is unspecified.
#[derive(Debug, Clone, Copy)]
pub struct PollingLock {
    retry_interval: Duration,
    max_attempts: usize,
}

impl PollingLock {
    pub fn new(retry_interval: Duration, max_attempts: usize) -> Self {
        Self {
            retry_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Upper bound on time spent waiting between attempts.
    pub fn budget(&self) -> Duration {
        let waits = u32::try_from(self.max_attempts - 1).unwrap_or(u32::MAX);
        self.retry_interval.saturating_mul(waits)
    }

    /// Try to take `key`, giving up after `max_attempts` failed attempts.
    ///
    /// Returns `Ok(false)` when the budget is spent. Store errors abort the
    /// loop immediately.
    pub async fn acquire(&self, store: &dyn BackingStore, key: &str) -> Result<bool, StoreError> {
        for attempt in 1..=self.max_attempts {
            if store.lock(key).await? {
                trace!(key = %key, attempt, "Lock acquired");
                return Ok(true);
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.retry_interval).await;
            }
        }

        debug!(
            key = %key,
            attempts = self.max_attempts,
            "Gave up waiting for lock"
        );
        Ok(false)
    }
}

/// A held store lock that is released even if its holder is cancelled.
///
/// [`release`](Self::release) unlocks and reports the outcome. A guard dropped
/// without being released, for instance because the future owning it was
/// dropped by a timeout, unlocks on a spawned task instead.
pub struct LockGuard {
    store: Arc<dyn BackingStore>,
    key: Option<String>,
}

impl LockGuard {
    /// Take ownership of a lock already acquired on `store`.
    pub fn new(store: Arc<dyn BackingStore>, key: String) -> Self {
        Self {
            store,
            key: Some(key),
        }
    }

    /// Unlock and wait for the store to confirm.
    ///
    /// The unlock runs on its own task, so cancelling the caller while it
    /// waits cannot skip it.
    pub async fn release(mut self) -> Result<(), StoreError> {
        let Some(key) = self.key.take() else {
            return Ok(());
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move { store.unlock(&key).await })
            .await
            .map_err(|e| StoreError::Backend(format!("unlock task failed: {}", e)))?
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(key = %key, "Lock holder went away, releasing lock");
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(e) = store.unlock(&key).await {
                        warn!(key = %key, error = %e, "Failed to release abandoned lock");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "No runtime left to release abandoned lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store whose lock only succeeds on the nth call.
    struct FlakyLock {
        calls: AtomicUsize,
        succeed_on: usize,
    }

    #[async_trait]
    impl BackingStore for FlakyLock {
        async fn get(&self, _key: &str) -> Result<Option<u64>, StoreError> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: u64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn lock(&self, _key: &str) -> Result<bool, StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n == self.succeed_on)
        }
        async fn unlock(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_acquires_free_lock() {
        let store = MemoryStore::new();
        let lock = PollingLock::new(Duration::from_millis(1), 3);
        assert!(lock.acquire(&store, "k").await.unwrap());
        assert!(store.is_locked("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let store = MemoryStore::new();
        store.lock("k").await.unwrap();

        let lock = PollingLock::new(Duration::from_millis(10), 5);
        let started = tokio::time::Instant::now();
        assert!(!lock.acquire(&store, "k").await.unwrap());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(40));
        assert!(waited < Duration::from_millis(50));
        assert_eq!(lock.budget(), Duration::from_millis(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let store = FlakyLock {
            calls: AtomicUsize::new(0),
            succeed_on: 4,
        };
        let lock = PollingLock::new(Duration::from_millis(1), 10);
        assert!(lock.acquire(&store, "k").await.unwrap());
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_attempt_count() {
        let store = FlakyLock {
            calls: AtomicUsize::new(0),
            succeed_on: usize::MAX,
        };
        let lock = PollingLock::new(Duration::from_millis(1), 6);
        assert!(!lock.acquire(&store, "k").await.unwrap());
        assert_eq!(store.calls.load(Ordering::SeqCst), 6);
    }

    async fn wait_unlocked(store: &MemoryStore, key: &str) -> bool {
        for _ in 0..100 {
            if !store.is_locked(key) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_guard_release_unlocks() {
        let store = MemoryStore::new();
        assert!(store.lock("k").await.unwrap());

        let guard = LockGuard::new(Arc::new(store.clone()), "k".to_string());
        guard.release().await.unwrap();
        assert!(!store.is_locked("k"));
    }

    #[tokio::test]
    async fn test_dropped_guard_unlocks() {
        let store = MemoryStore::new();
        assert!(store.lock("k").await.unwrap());

        drop(LockGuard::new(Arc::new(store.clone()), "k".to_string()));
        assert!(wait_unlocked(&store, "k").await);
    }

    #[tokio::test]
    async fn test_released_guard_does_not_unlock_twice() {
        let store = MemoryStore::new();
        assert!(store.lock("k").await.unwrap());
        LockGuard::new(Arc::new(store.clone()), "k".to_string())
            .release()
            .await
            .unwrap();

        // Someone else takes the lock; the released guard must leave it alone.
        assert!(store.lock("k").await.unwrap());
        tokio::task::yield_now().await;
        assert!(store.is_locked("k"));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        let lock = PollingLock::new(Duration::from_millis(1), 0);
        assert_eq!(lock.budget(), Duration::ZERO);
    }
}
