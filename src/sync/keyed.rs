//! Per-key async lock
//!
//! Lazily creates one lock per key. The SSH pool uses this to guarantee
//! single-flight connection creation: two concurrent first-uses of the
//! same `user@host:port` serialize here instead of racing to open two
//! physical connections.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

/// Map of lazily-created per-key locks.
pub struct KeyedMutex<K: Eq + Hash + Clone> {
    locks: parking_lot::Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    /// New, empty.
    pub fn new() -> Self {
        Self {
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Wait for the lock of `key`; at most one holder per key.
    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        self.lock_for(key).lock_owned().await
    }

    /// Run `f` while holding the lock of `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &K, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await;
        f().await
    }

    /// Drop the lock entry for `key`. A holder keeps its guard alive via
    /// the `Arc`; future acquires get a fresh lock.
    pub fn remove(&self, key: &K) {
        self.locks.lock().remove(key);
    }

    /// Number of keys with a lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no key has a lock entry.
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_same_key_serializes() {
        let m = Arc::new(KeyedMutex::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let m = Arc::clone(&m);
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                m.with_lock(&"host-a".to_string(), || async {
                    let n = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(n, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_concurrently() {
        let m = Arc::new(KeyedMutex::new());

        // Hold key A while acquiring key B; must not block.
        let _a = m.acquire(&"a".to_string()).await;
        let b = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            m.acquire(&"b".to_string()),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_remove_resets_entry() {
        let m = KeyedMutex::new();
        let _g = m.acquire(&1u32).await;
        assert_eq!(m.len(), 1);
        m.remove(&1u32);
        assert!(m.is_empty());
        // A new acquire works against a fresh lock.
        let _g2 = m.acquire(&1u32).await;
    }
}
