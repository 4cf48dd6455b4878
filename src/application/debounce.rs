//! Trailing, fixed-window debouncing keyed by an arbitrary id.
//!
//! The first `schedule` for a key arms a timer; further calls for the same key
//! are absorbed until it fires. The key is released before the action runs, so
//! an event arriving while the action is in flight opens a new window.

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct Debouncer<K> {
    window: Duration,
    pending: Arc<Mutex<HashSet<K>>>,
}

impl<K> Debouncer<K>
where
    K: Hash + Eq + Clone + Send + 'static,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Schedule `action` one window from now unless `key` is already armed.
    /// Returns false when the call was absorbed.
    pub async fn schedule<F, Fut>(&self, key: K, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.pending.lock().await.insert(key.clone()) {
            return false;
        }

        let pending = self.pending.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            pending.lock().await.remove(&key);
            action().await;
        });
        true
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_burst_coalesces_to_one_action() {
        let debouncer = Debouncer::new(Duration::from_millis(50));
        let fired = Arc::new(AtomicUsize::new(0));

        let mut armed = 0;
        for _ in 0..10 {
            let fired = fired.clone();
            if debouncer
                .schedule(7_i64, move || async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .await
            {
                armed += 1;
            }
        }
        assert_eq!(armed, 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent_and_windows_reopen() {
        let debouncer = Debouncer::new(Duration::from_millis(30));
        let fired = Arc::new(AtomicUsize::new(0));

        for key in [1_i64, 2, 1] {
            let fired = fired.clone();
            debouncer
                .schedule(key, move || async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        let again = fired.clone();
        assert!(
            debouncer
                .schedule(1, move || async move {
                    again.fetch_add(1, Ordering::SeqCst);
                })
                .await
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
