//! Per-thread serial execution.
//!
//! Dispatches for the same `(channel, external_thread_id)` must complete in
//! receipt order; unrelated threads proceed in parallel. Each thread key
//! owns a tokio mutex; workers take the lock for the dispatch phase only.
//! Entries are pruned opportunistically once no worker holds them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

const PRUNE_WATERMARK: usize = 1024;

#[derive(Default)]
pub struct ThreadSerializer {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ThreadSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize on `(channel, thread)`; envelopes without a thread identity
    /// get no serialization (`None` key).
    pub async fn acquire(&self, key: Option<(&str, &str)>) -> Option<OwnedMutexGuard<()>> {
        let (channel, thread) = key?;
        let composite = format!("{channel}\u{1f}{thread}");

        let lock = {
            let mut g = self.locks.lock().expect("serializer lock poisoned");
            if g.len() > PRUNE_WATERMARK {
                g.retain(|_, l| Arc::strong_count(l) > 1);
            }
            g.entry(composite)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        Some(lock.lock_owned().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_thread_serializes_in_acquisition_order() {
        let serializer = Arc::new(ThreadSerializer::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let serializer = Arc::clone(&serializer);
            let order = Arc::clone(&order);
            let running = Arc::clone(&running);
            handles.push(tokio::spawn(async move {
                // Stagger arrival so acquisition order is deterministic.
                tokio::time::sleep(Duration::from_millis(20 * i as u64)).await;
                let guard = serializer.acquire(Some(("telegram", "th-1"))).await;
                assert!(guard.is_some());

                let concurrent = running.fetch_add(1, Ordering::SeqCst);
                assert_eq!(concurrent, 0, "two workers inside the same thread section");
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);

                order.lock().unwrap().push(i);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn different_threads_run_in_parallel() {
        let serializer = Arc::new(ThreadSerializer::new());

        let a = serializer.acquire(Some(("telegram", "th-a"))).await;
        // Holding th-a must not block th-b.
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            serializer.acquire(Some(("telegram", "th-b"))),
        )
        .await
        .expect("unrelated thread should not block");

        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn threadless_envelopes_skip_serialization() {
        let serializer = ThreadSerializer::new();
        assert!(serializer.acquire(None).await.is_none());
    }
}
