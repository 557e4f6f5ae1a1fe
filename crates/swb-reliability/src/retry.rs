//! Bounded retry with exponential backoff and full jitter.

use std::time::Duration;

use rand::Rng;

use swb_schemas::ErrorCategory;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_ms: u64, cap_ms: u64) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
        }
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn retries_remain(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Whether this failure is eligible for another attempt at all.
    pub fn should_retry(&self, attempt: u32, category: ErrorCategory) -> bool {
        category.is_retriable() && self.retries_remain(attempt)
    }

    /// Backoff before attempt `attempt + 1`: full jitter over an
    /// exponentially growing ceiling, clamped to `cap`. A `Retry-After`
    /// hint from the target (429/503) takes precedence when longer.
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling_ms = self
            .base
            .as_millis()
            .saturating_mul(1u128 << exp)
            .min(self.cap.as_millis()) as u64;

        let jittered = if ceiling_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
        };

        match retry_after {
            Some(hint) if hint > jittered => hint.min(self.cap),
            _ => jittered,
        }
    }
}

/// Parse a `Retry-After` header value. Only the delta-seconds form is
/// honored; HTTP-date values are ignored (a clock-skewed target should not
/// control our schedule).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_budget_is_bounded() {
        let p = RetryPolicy::new(3, 200, 5_000);
        assert!(p.retries_remain(1));
        assert!(p.retries_remain(2));
        assert!(!p.retries_remain(3));
    }

    #[test]
    fn non_retriable_categories_never_retry() {
        let p = RetryPolicy::new(3, 200, 5_000);
        assert!(!p.should_retry(1, ErrorCategory::ValidationError));
        assert!(!p.should_retry(1, ErrorCategory::PolicyViolation));
        assert!(p.should_retry(1, ErrorCategory::Timeout));
        assert!(p.should_retry(1, ErrorCategory::DownstreamFailure));
    }

    #[test]
    fn backoff_stays_within_cap() {
        let p = RetryPolicy::new(10, 200, 5_000);
        for attempt in 1..10 {
            let d = p.backoff(attempt, None);
            assert!(d <= Duration::from_millis(5_000), "attempt {attempt}: {d:?}");
        }
    }

    #[test]
    fn retry_after_hint_extends_backoff() {
        let p = RetryPolicy::new(3, 1, 60_000);
        let d = p.backoff(1, Some(Duration::from_secs(7)));
        assert!(d >= Duration::from_secs(7));
    }

    #[test]
    fn retry_after_hint_is_clamped_to_cap() {
        let p = RetryPolicy::new(3, 200, 5_000);
        let d = p.backoff(1, Some(Duration::from_secs(3600)));
        assert_eq!(d, Duration::from_millis(5_000));
    }

    #[test]
    fn parses_delta_seconds_only() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);
    }
}
