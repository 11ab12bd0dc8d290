use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Distributed-lock seam.
///
/// Production deployments back this with a Redis-style store so only one
/// process scans due tasks per tick; the in-process implementation keeps the
/// same contract for single-node runs and tests.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Try to take `key` for `ttl`. Returns a fencing token, or None if held.
    async fn acquire(&self, key: &str, ttl: Duration) -> Option<u64>;
    /// Release `key` if `token` still owns it.
    async fn release(&self, key: &str, token: u64);
}

#[derive(Default)]
pub struct InProcessLockStore {
    held: Mutex<HashMap<String, (u64, Instant)>>,
    counter: std::sync::atomic::AtomicU64,
}

impl InProcessLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InProcessLockStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Option<u64> {
        let mut guard = self.held.lock().ok()?;
        if let Some((_, expires_at)) = guard.get(key)
            && *expires_at > Instant::now()
        {
            return None;
        }
        let token = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        guard.insert(key.to_string(), (token, Instant::now() + ttl));
        Some(token)
    }

    async fn release(&self, key: &str, token: u64) {
        if let Ok(mut guard) = self.held.lock()
            && guard.get(key).is_some_and(|(held, _)| *held == token)
        {
            guard.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_excludes_second_holder_until_release() {
        let store = InProcessLockStore::new();
        let token = store.acquire("poller", Duration::from_secs(60)).await.unwrap();
        assert!(store.acquire("poller", Duration::from_secs(60)).await.is_none());
        store.release("poller", token).await;
        assert!(store.acquire("poller", Duration::from_secs(60)).await.is_some());
    }

    #[tokio::test]
    async fn expired_lock_is_reacquirable() {
        let store = InProcessLockStore::new();
        store.acquire("poller", Duration::from_millis(0)).await.unwrap();
        assert!(store.acquire("poller", Duration::from_secs(1)).await.is_some());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_new_lock() {
        let store = InProcessLockStore::new();
        let stale = store.acquire("poller", Duration::from_millis(0)).await.unwrap();
        let fresh = store.acquire("poller", Duration::from_secs(60)).await.unwrap();
        store.release("poller", stale).await;
        assert!(store.acquire("poller", Duration::from_secs(60)).await.is_none());
        store.release("poller", fresh).await;
    }
}
