//! Token buckets per (target, policy tier).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use swb_schemas::PolicyTier;

#[derive(Debug)]
struct BucketInner {
    tokens: f64,
    updated_at: Instant,
}

/// Classic token bucket: capacity + refill rate, one token per admission.
/// Admissions over any interval Δt are bounded by `capacity + refill · Δt`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    inner: Mutex<BucketInner>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        let now = Instant::now();
        Self {
            capacity,
            refill_per_sec,
            inner: Mutex::new(BucketInner {
                tokens: capacity,
                updated_at: now,
            }),
        }
    }

    pub fn try_admit_now(&self) -> bool {
        self.try_admit(Instant::now())
    }

    /// Refill for elapsed time, then take one token if available.
    pub fn try_admit(&self, now: Instant) -> bool {
        let mut g = self.inner.lock().expect("bucket lock poisoned");

        let elapsed = now.saturating_duration_since(g.updated_at).as_secs_f64();
        g.tokens = (g.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        g.updated_at = now;

        if g.tokens >= 1.0 {
            g.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&self, now: Instant) -> f64 {
        let mut g = self.inner.lock().expect("bucket lock poisoned");
        let elapsed = now.saturating_duration_since(g.updated_at).as_secs_f64();
        g.tokens = (g.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        g.updated_at = now;
        g.tokens
    }
}

/// Per-tier rates, one bucket per (target, tier), created on first use.
pub struct RateLimiter {
    rates: Box<dyn Fn(PolicyTier) -> (f64, f64) + Send + Sync>,
    buckets: Mutex<HashMap<(String, PolicyTier), Arc<TokenBucket>>>,
}

impl RateLimiter {
    /// `rates` maps a tier to `(capacity, refill_per_sec)`.
    pub fn new(rates: impl Fn(PolicyTier) -> (f64, f64) + Send + Sync + 'static) -> Self {
        Self {
            rates: Box::new(rates),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn bucket(&self, target: &str, tier: PolicyTier) -> Arc<TokenBucket> {
        let mut g = self.buckets.lock().expect("limiter lock poisoned");
        g.entry((target.to_string(), tier))
            .or_insert_with(|| {
                let (capacity, refill) = (self.rates)(tier);
                Arc::new(TokenBucket::new(capacity, refill))
            })
            .clone()
    }

    pub fn try_admit(&self, target: &str, tier: PolicyTier) -> bool {
        self.bucket(target, tier).try_admit_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn admissions_bounded_by_capacity() {
        let b = TokenBucket::new(3.0, 0.0);
        let t0 = Instant::now();

        assert!(b.try_admit(t0));
        assert!(b.try_admit(t0));
        assert!(b.try_admit(t0));
        assert!(!b.try_admit(t0), "fourth admission must be refused");
    }

    #[test]
    fn refill_restores_tokens_over_time() {
        let b = TokenBucket::new(2.0, 1.0);
        let t0 = Instant::now();

        assert!(b.try_admit(t0));
        assert!(b.try_admit(t0));
        assert!(!b.try_admit(t0));

        // 1.5s at 1 token/sec -> one admission available, not two.
        let t1 = t0 + Duration::from_millis(1500);
        assert!(b.try_admit(t1));
        assert!(!b.try_admit(t1));
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let b = TokenBucket::new(2.0, 100.0);
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(3600);
        assert!(b.available(t1) <= 2.0);
    }

    #[test]
    fn admissions_bounded_by_capacity_plus_refill() {
        // capacity 5, refill 2/s, over 3s: at most 5 + 2*3 = 11 admissions.
        let b = TokenBucket::new(5.0, 2.0);
        let t0 = Instant::now();

        let mut admitted = 0;
        for ms in (0..3000).step_by(50) {
            if b.try_admit(t0 + Duration::from_millis(ms)) {
                admitted += 1;
            }
        }
        assert!(admitted <= 11, "admitted {admitted} > capacity + refill * dt");
    }

    #[test]
    fn limiter_separates_targets_and_tiers() {
        let limiter = RateLimiter::new(|tier| match tier {
            PolicyTier::Realtime => (2.0, 0.0),
            PolicyTier::Default => (1.0, 0.0),
            PolicyTier::Bulk => (1.0, 0.0),
        });

        assert!(limiter.try_admit("a", PolicyTier::Default));
        assert!(!limiter.try_admit("a", PolicyTier::Default));
        // Different target: fresh bucket.
        assert!(limiter.try_admit("b", PolicyTier::Default));
        // Different tier on the same target: fresh bucket.
        assert!(limiter.try_admit("a", PolicyTier::Realtime));
    }
}
