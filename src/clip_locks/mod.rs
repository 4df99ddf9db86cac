//! ClipLocks - Per-Clip Conversion Locks
//!
//! ## Purpose
//!
//! - Serialize concurrent reads of the same raw clip so it is encoded once
//! - A second reader waits for the first conversion, then finds the video
//! - Locks are keyed per clip and never shared with frame ingestion

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

/// Default wait timeout (matches the default encoder timeout)
const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

/// ClipLocks - serializes conversion per clip key
pub struct ClipLocks {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    wait_timeout: Duration,
}

impl ClipLocks {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS))
    }

    pub fn with_timeout(wait_timeout: Duration) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            wait_timeout,
        }
    }

    /// Acquire the lock for `key`, waiting up to the configured timeout.
    /// The lock is released when the returned lease is dropped.
    pub async fn acquire(&self, key: &str) -> Result<ClipLease, ClipLockError> {
        let lock = self.get_or_create_lock(key).await;

        match timeout(self.wait_timeout, lock.lock_owned()).await {
            Ok(guard) => {
                tracing::trace!(clip = %key, "Clip lock acquired");
                Ok(ClipLease {
                    key: key.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => {
                tracing::warn!(
                    clip = %key,
                    timeout_ms = self.wait_timeout.as_millis() as u64,
                    "Clip lock timeout - conversion still running"
                );
                Err(ClipLockError::Busy)
            }
        }
    }

    /// Drop lock entries nobody holds or waits on
    pub async fn prune(&self) -> usize {
        let mut locks = self.locks.write().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_lock().is_err());
        before - locks.len()
    }

    async fn get_or_create_lock(&self, key: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(key) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for ClipLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Held conversion lock - released on drop
pub struct ClipLease {
    key: String,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for ClipLease {
    fn drop(&mut self) {
        tracing::trace!(clip = %self.key, "Clip lock released");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClipLockError {
    #[error("clip conversion in progress (timeout)")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_release() {
        let locks = ClipLocks::new();

        let lease = locks.acquire("room/100-200").await.unwrap();
        drop(lease);

        let _again = locks.acquire("room/100-200").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let locks = ClipLocks::with_timeout(Duration::from_millis(100));
        let _held = locks.acquire("room/100-200").await.unwrap();
        assert!(locks.acquire("room/300-400").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let locks = ClipLocks::with_timeout(Duration::from_millis(100));
        let _held = locks.acquire("room/100-200").await.unwrap();
        let result = locks.acquire("room/100-200").await;
        assert!(matches!(result, Err(ClipLockError::Busy)));
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = ClipLocks::new();
        let held = locks.acquire("a").await.unwrap();
        drop(locks.acquire("b").await.unwrap());

        assert_eq!(locks.prune().await, 1);
        assert_eq!(locks.prune().await, 0);

        drop(held);
        assert_eq!(locks.prune().await, 1);
    }
}
