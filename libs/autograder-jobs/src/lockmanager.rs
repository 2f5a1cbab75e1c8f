/// Keyed Lock Registry
///
/// Maps an arbitrary string key to a dedicated mutex. Locks are created on
/// first use (load-or-store) and never evicted, so the registry only grows
/// with the number of distinct keys seen over the process lifetime.
///
/// Used to serialize access to a shared resource (a listener, a course's
/// compute budget) and to serialize work per logical entity (one grading
/// target).
///
/// **Not re-entrant:** locking a key that the same path already holds
/// deadlocks. Release happens when the returned guard is dropped, so every
/// exit path (success, `?`, panic, cancellation) unlocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held lock for one key. Dropping it unlocks.
#[derive(Debug)]
pub struct KeyedLockGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Explicit unlock, same as dropping the guard
    pub fn unlock(self) {}
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        trace!(key = %self.key, "Released keyed lock");
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the lock for `key`, storing a fresh one if none exists yet.
    /// Racing callers always observe the same instance.
    fn load_or_store(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Block until `key` is free, then hold it
    pub async fn lock(&self, key: &str) -> KeyedLockGuard {
        let lock = self.load_or_store(key);
        let guard = lock.lock_owned().await;
        trace!(key = %key, "Acquired keyed lock");

        KeyedLockGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Like [`lock`](Self::lock), but gives up with `None` once `cancel` fires
    pub async fn lock_cancellable(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Option<KeyedLockGuard> {
        let lock = self.load_or_store(key);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!(key = %key, "Gave up waiting for keyed lock");
                None
            }
            guard = lock.lock_owned() => {
                trace!(key = %key, "Acquired keyed lock");
                Some(KeyedLockGuard {
                    key: key.to_string(),
                    _guard: guard,
                })
            }
        }
    }

    /// Take the lock only if nobody holds it right now
    pub fn try_lock(&self, key: &str) -> Option<KeyedLockGuard> {
        let lock = self.load_or_store(key);
        lock.try_lock_owned().ok().map(|guard| KeyedLockGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Number of distinct keys ever locked
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_same_lock() {
        let locks = LockManager::new();

        let guard = locks.lock("course101").await;
        assert_eq!(guard.key(), "course101");
        assert!(locks.try_lock("course101").is_none(), "Key should be held");

        guard.unlock();
        assert!(locks.try_lock("course101").is_some(), "Key should be free after unlock");
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let locks = LockManager::new();

        let _a = locks.lock("a").await;
        let b = locks.try_lock("b");
        assert!(b.is_some(), "Holding 'a' must not block 'b'");
    }

    #[tokio::test]
    async fn test_registry_grows_monotonically() {
        let locks = LockManager::new();
        assert!(locks.is_empty());

        drop(locks.lock("a").await);
        drop(locks.lock("b").await);
        drop(locks.lock("a").await);

        assert_eq!(locks.len(), 2);
        assert!(locks.contains("a"));
        assert!(locks.contains("b"));
        assert!(!locks.contains("c"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lock_serializes_holders() {
        let locks = Arc::new(LockManager::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("shared").await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_cancellable_gives_up() {
        let locks = LockManager::new();
        let _held = locks.lock("busy").await;

        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            async move { locks.lock_cancellable("busy", &cancel).await.is_none() }
        };

        cancel.cancel();
        assert!(waiter.await, "Cancelled wait should return None");
    }

    #[tokio::test]
    async fn test_guard_released_on_panic() {
        let locks = Arc::new(LockManager::new());

        let panicking = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("target").await;
                panic!("grading blew up");
            })
        };
        assert!(panicking.await.is_err());

        assert!(locks.try_lock("target").is_some(), "Panic must still release the lock");
    }
}
