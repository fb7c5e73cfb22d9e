use log::*;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Per-key cancellable expiry timers. Each scheduled key owns one spawned
/// task; rescheduling a key aborts the previous task first.
///
/// A timer may fire after the lease it guards was already released. The
/// action must treat a missing lease as benign; the scheduler itself makes
/// no claim beyond "the delay elapsed without a cancel".
pub struct ExpiryScheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    timers: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> ExpiryScheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(ExpiryScheduler {
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn schedule<F>(self: &Arc<Self>, key: K, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let this = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Drop our own registration before running the action, so an
            // action that cancels its key does not abort itself.
            this.timers.lock().unwrap().remove(&task_key);
            debug!("expiry timer fired for {:?}", task_key);
            action.await;
        });

        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.insert(key, handle) {
            old.abort();
        }
    }

    /// Returns true if a pending timer was cancelled.
    pub fn cancel(&self, key: &K) -> bool {
        match self.timers.lock().unwrap().remove(key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    pub fn shutdown(&self) {
        let mut timers = self.timers.lock().unwrap();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_fire_and_cancel() {
        let scheduler = ExpiryScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f1 = fired.clone();
        scheduler.schedule(1i64, Duration::from_millis(20), async move {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        let f2 = fired.clone();
        scheduler.schedule(2i64, Duration::from_millis(20), async move {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel(&2));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
        assert!(!scheduler.cancel(&1));
    }

    #[tokio::test]
    async fn test_reschedule_replaces() {
        let scheduler = ExpiryScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f1 = fired.clone();
        scheduler.schedule(7i64, Duration::from_millis(500), async move {
            f1.fetch_add(1, Ordering::SeqCst);
        });
        let f2 = fired.clone();
        scheduler.schedule(7i64, Duration::from_millis(20), async move {
            f2.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_action_may_cancel_own_key() {
        let scheduler = ExpiryScheduler::new();
        let fired = Arc::new(AtomicU32::new(0));

        let sched = scheduler.clone();
        let f1 = fired.clone();
        scheduler.schedule(3i64, Duration::from_millis(20), async move {
            sched.cancel(&3i64);
            f1.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
