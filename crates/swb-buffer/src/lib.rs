//! Durable buffer: tiered priority queue with a starvation guard.
//!
//! Three tiers (`realtime > default > bulk`), FIFO within a tier. The
//! scheduler serves the highest non-empty tier, except that after `S`
//! consecutive dequeues which skipped over waiting lower-tier work, one slot
//! is yielded to the highest non-empty lower tier.
//!
//! Backpressure: past `max_depth`, enqueues are accepted but flagged
//! deferred (the caller leaves the request in `accepted` and lets the worker
//! loop catch up); past `hard_limit`, bulk-tier ingress is rejected with an
//! overload signal. Higher tiers are never rejected by the buffer.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use swb_schemas::PolicyTier;

#[derive(Debug, Clone, Copy)]
pub struct BufferConfig {
    pub max_depth: usize,
    pub hard_limit: usize,
    /// S: consecutive priority dequeues before a lower tier gets a slot.
    pub starvation_guard: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_depth: 10_000,
            hard_limit: 50_000,
            starvation_guard: 100,
        }
    }
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Accepted, but the queue is past `max_depth`; scheduling is deferred.
    Deferred,
    /// Bulk ingress at `hard_limit`; the caller surfaces `overload`.
    Rejected,
}

// Serve order: index 0 is dequeued first.
fn tier_index(tier: PolicyTier) -> usize {
    match tier {
        PolicyTier::Realtime => 0,
        PolicyTier::Default => 1,
        PolicyTier::Bulk => 2,
    }
}

const TIERS: [PolicyTier; 3] = [PolicyTier::Realtime, PolicyTier::Default, PolicyTier::Bulk];

struct Inner<T> {
    queues: [VecDeque<T>; 3],
    /// Consecutive dequeues that skipped waiting lower-tier work.
    priority_streak: u32,
}

pub struct TieredBuffer<T> {
    cfg: BufferConfig,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> TieredBuffer<T> {
    pub fn new(cfg: BufferConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                priority_streak: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn enqueue(&self, tier: PolicyTier, item: T) -> EnqueueOutcome {
        let outcome = {
            let mut g = self.inner.lock().expect("buffer lock poisoned");
            let depth: usize = g.queues.iter().map(VecDeque::len).sum();

            if depth >= self.cfg.hard_limit && tier == PolicyTier::Bulk {
                return EnqueueOutcome::Rejected;
            }

            g.queues[tier_index(tier)].push_back(item);

            if depth >= self.cfg.max_depth {
                EnqueueOutcome::Deferred
            } else {
                EnqueueOutcome::Enqueued
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Dequeue honoring tier priority and the starvation guard.
    pub fn try_dequeue(&self) -> Option<(PolicyTier, T)> {
        let mut g = self.inner.lock().expect("buffer lock poisoned");

        let first_non_empty = TIERS
            .into_iter()
            .find(|t| !g.queues[tier_index(*t)].is_empty())?;

        // Guard trip: hand the slot to the highest non-empty tier below the
        // one priority would pick.
        let pick = if g.priority_streak >= self.cfg.starvation_guard {
            TIERS
                .into_iter()
                .filter(|t| t.rank() < first_non_empty.rank())
                .find(|t| !g.queues[tier_index(*t)].is_empty())
                .unwrap_or(first_non_empty)
        } else {
            first_non_empty
        };

        let lower_waiting = TIERS
            .into_iter()
            .any(|t| t.rank() < pick.rank() && !g.queues[tier_index(t)].is_empty());

        if pick != first_non_empty {
            // Yielded slot; the guard resets.
            g.priority_streak = 0;
        } else if lower_waiting {
            g.priority_streak += 1;
        } else {
            g.priority_streak = 0;
        }

        let item = g.queues[tier_index(pick)].pop_front()?;
        Some((pick, item))
    }

    /// Wait until an item is available, then dequeue it.
    pub async fn dequeue(&self) -> (PolicyTier, T) {
        loop {
            if let Some(pair) = self.try_dequeue() {
                return pair;
            }
            self.notify.notified().await;
        }
    }

    pub fn depth(&self, tier: PolicyTier) -> usize {
        let g = self.inner.lock().expect("buffer lock poisoned");
        g.queues[tier_index(tier)].len()
    }

    pub fn total_depth(&self) -> usize {
        let g = self.inner.lock().expect("buffer lock poisoned");
        g.queues.iter().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(guard: u32) -> TieredBuffer<u32> {
        TieredBuffer::new(BufferConfig {
            max_depth: 4,
            hard_limit: 8,
            starvation_guard: guard,
        })
    }

    #[test]
    fn fifo_within_a_tier() {
        let b = buffer(100);
        b.enqueue(PolicyTier::Default, 1);
        b.enqueue(PolicyTier::Default, 2);
        b.enqueue(PolicyTier::Default, 3);

        assert_eq!(b.try_dequeue(), Some((PolicyTier::Default, 1)));
        assert_eq!(b.try_dequeue(), Some((PolicyTier::Default, 2)));
        assert_eq!(b.try_dequeue(), Some((PolicyTier::Default, 3)));
        assert_eq!(b.try_dequeue(), None);
    }

    #[test]
    fn higher_tier_served_first() {
        let b = buffer(100);
        b.enqueue(PolicyTier::Bulk, 10);
        b.enqueue(PolicyTier::Realtime, 1);
        b.enqueue(PolicyTier::Default, 5);

        assert_eq!(b.try_dequeue(), Some((PolicyTier::Realtime, 1)));
        assert_eq!(b.try_dequeue(), Some((PolicyTier::Default, 5)));
        assert_eq!(b.try_dequeue(), Some((PolicyTier::Bulk, 10)));
    }

    #[test]
    fn starvation_guard_yields_one_slot() {
        let b = TieredBuffer::new(BufferConfig {
            max_depth: 1_000,
            hard_limit: 2_000,
            starvation_guard: 100,
        });
        for i in 0..150u32 {
            b.enqueue(PolicyTier::Realtime, i);
        }
        b.enqueue(PolicyTier::Bulk, 9_999);

        // 100 consecutive realtime dequeues build the streak...
        for i in 0..100u32 {
            assert_eq!(b.try_dequeue(), Some((PolicyTier::Realtime, i)));
        }
        // ...the 101st must come from bulk.
        assert_eq!(b.try_dequeue(), Some((PolicyTier::Bulk, 9_999)));
        // Then back to priority order.
        assert_eq!(b.try_dequeue(), Some((PolicyTier::Realtime, 100)));
    }

    #[test]
    fn streak_resets_when_no_lower_tier_waits() {
        let b = buffer(2);
        b.enqueue(PolicyTier::Realtime, 1);
        b.enqueue(PolicyTier::Realtime, 2);
        assert!(b.try_dequeue().is_some());
        assert!(b.try_dequeue().is_some());

        // Lower-tier work arrives only now; the old streak must not count.
        b.enqueue(PolicyTier::Realtime, 3);
        b.enqueue(PolicyTier::Bulk, 4);
        assert_eq!(b.try_dequeue(), Some((PolicyTier::Realtime, 3)));
    }

    #[test]
    fn deferred_past_max_depth() {
        let b = buffer(100);
        for i in 0..4 {
            assert_eq!(b.enqueue(PolicyTier::Default, i), EnqueueOutcome::Enqueued);
        }
        assert_eq!(b.enqueue(PolicyTier::Default, 4), EnqueueOutcome::Deferred);
    }

    #[test]
    fn bulk_rejected_at_hard_limit_but_higher_tiers_accepted() {
        let b = buffer(100);
        for i in 0..8 {
            b.enqueue(PolicyTier::Default, i);
        }
        assert_eq!(b.enqueue(PolicyTier::Bulk, 100), EnqueueOutcome::Rejected);
        assert_eq!(b.enqueue(PolicyTier::Realtime, 101), EnqueueOutcome::Deferred);
        assert_eq!(b.depth(PolicyTier::Realtime), 1);
    }

    #[tokio::test]
    async fn async_dequeue_wakes_on_enqueue() {
        use std::sync::Arc;
        let b = Arc::new(buffer(100));

        let waiter = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.dequeue().await })
        };
        tokio::task::yield_now().await;

        b.enqueue(PolicyTier::Default, 42);
        let (tier, item) = waiter.await.unwrap();
        assert_eq!((tier, item), (PolicyTier::Default, 42));
    }
}
