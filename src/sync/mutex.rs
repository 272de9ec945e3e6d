//! FIFO-fair async mutex
//!
//! Thin wrapper over `tokio::sync::Mutex<()>`, which queues waiters in
//! arrival order. Exists so call sites read as lock acquisition rather
//! than data access, and to host the `with_lock` scope helper.

use std::future::Future;

/// Fair async lock.
pub struct Mutex {
    inner: tokio::sync::Mutex<()>,
}

/// Guard returned by [`Mutex::acquire`]; releases on drop.
pub struct MutexGuard<'a> {
    _inner: tokio::sync::MutexGuard<'a, ()>,
}

impl Mutex {
    /// New, unlocked.
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(()),
        }
    }

    /// Wait for the lock; waiters are served in FIFO order.
    pub async fn acquire(&self) -> MutexGuard<'_> {
        MutexGuard {
            _inner: self.inner.lock().await,
        }
    }

    /// Try to take the lock without waiting.
    pub fn try_acquire(&self) -> Option<MutexGuard<'_>> {
        self.inner
            .try_lock()
            .ok()
            .map(|guard| MutexGuard { _inner: guard })
    }

    /// Run `f` while holding the lock.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire().await;
        f().await
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
