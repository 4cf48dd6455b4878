//! Small bounded time-to-live cache.
//!
//! Used for short-lived memoization: robot metadata on the stream path and
//! ticker lookups during close resolution. Entries expire individually; the
//! LRU bound keeps memory flat when keys churn.

use lru::LruCache;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub struct TtlCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, (V, Instant)>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live value for `key`; expired entries are evicted on the way
    pub async fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => {
                return Some(value.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub async fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.ttl).await;
    }

    pub async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.put(key, (value, Instant::now() + ttl));
    }

    pub async fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().await;
        entries.pop(key).map(|(value, _)| value)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Returns the cached value or runs `loader` and caches its success.
    ///
    /// The lock is not held while `loader` runs, so concurrent misses may
    /// both load; the last writer wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = loader().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }
}

impl<K> TtlCache<K, ()>
where
    K: Hash + Eq + Clone,
{
    /// Throttle helper: true (and marks `key`) when absent or expired.
    pub async fn check_and_mark(&self, key: K) -> bool {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = entries.get(&key) {
            if *expires_at > now {
                return false;
            }
        }
        entries.put(key, ((), now + self.ttl));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_expire() {
        let cache: TtlCache<&str, u32> = TtlCache::new(8, Duration::from_millis(50));
        cache.insert("a", 1).await;
        assert_eq!(cache.get(&"a").await, Some(1));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get(&"a").await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let cache: TtlCache<u32, u32> = TtlCache::new(2, Duration::from_secs(60));
        cache.insert(1, 10).await;
        cache.insert(2, 20).await;
        cache.get(&1).await;
        cache.insert(3, 30).await;
        assert_eq!(cache.get(&2).await, None);
        assert_eq!(cache.get(&1).await, Some(10));
    }

    #[tokio::test]
    async fn test_loader_runs_once_per_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(8, Duration::from_secs(60));
        let mut calls = 0;
        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with("k", || {
                    calls += 1;
                    async { Ok::<_, String>(7) }
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls, 1);

        let failed: Result<u32, String> = cache
            .get_or_try_insert_with("missing", || async { Err("boom".to_string()) })
            .await;
        assert!(failed.is_err());
        assert_eq!(cache.get(&"missing").await, None);
    }

    #[tokio::test]
    async fn test_check_and_mark_throttles() {
        let cache: TtlCache<i64, ()> = TtlCache::new(8, Duration::from_millis(50));
        assert!(cache.check_and_mark(1).await);
        assert!(!cache.check_and_mark(1).await);
        assert!(cache.check_and_mark(2).await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.check_and_mark(1).await);
    }
}
