//! Per-target circuit breaker.
//!
//! ```text
//!            N consecutive failures within W
//!   Closed ────────────────────────────────► Open
//!     ▲                                        │ cooldown D elapsed
//!     │  P consecutive probe successes         ▼
//!     └──────────────────────────────────  HalfOpen ──(any failure)──► Open
//! ```
//!
//! Admission in `HalfOpen` is capped at `P` in-flight probes. Methods take an
//! explicit `now` so the transitions are testable without sleeping; the
//! `*_now` wrappers are what production code calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// N: consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// W: failures older than this no longer count toward N.
    pub window: Duration,
    /// D: how long an open circuit rejects before probing.
    pub cooldown: Duration,
    /// P: probes allowed in half-open; that many consecutive successes close.
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Fast rejection: the target's circuit is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpenError {
    pub target: String,
    /// Time remaining until the next probe window.
    pub retry_after: Duration,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "circuit open for {}; retry after {:?}",
            self.target, self.retry_after
        )
    }
}

impl std::error::Error for CircuitOpenError {}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    probe_successes: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    cfg: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            cfg,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("circuit lock poisoned").state
    }

    pub fn try_admit_now(&self) -> Result<(), CircuitOpenError> {
        self.try_admit(Instant::now())
    }

    pub fn record_success_now(&self) {
        self.record_success(Instant::now())
    }

    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure_now(&self) -> bool {
        self.record_failure(Instant::now())
    }

    /// Ask to send one call to the target.
    pub fn try_admit(&self, now: Instant) -> Result<(), CircuitOpenError> {
        let mut g = self.inner.lock().expect("circuit lock poisoned");
        match g.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = g.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.cfg.cooldown {
                    g.state = CircuitState::HalfOpen;
                    g.probes_in_flight = 1;
                    g.probe_successes = 0;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        target: self.target.clone(),
                        retry_after: self.cfg.cooldown - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if g.probes_in_flight < self.cfg.half_open_probes {
                    g.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        target: self.target.clone(),
                        retry_after: Duration::ZERO,
                    })
                }
            }
        }
    }

    pub fn record_success(&self, _now: Instant) {
        let mut g = self.inner.lock().expect("circuit lock poisoned");
        match g.state {
            CircuitState::Closed => {
                g.consecutive_failures = 0;
                g.first_failure_at = None;
            }
            CircuitState::HalfOpen => {
                g.probes_in_flight = g.probes_in_flight.saturating_sub(1);
                g.probe_successes += 1;
                if g.probe_successes >= self.cfg.half_open_probes {
                    g.state = CircuitState::Closed;
                    g.consecutive_failures = 0;
                    g.first_failure_at = None;
                    g.opened_at = None;
                    g.probes_in_flight = 0;
                    g.probe_successes = 0;
                }
            }
            // A success while Open can only be a call admitted before the
            // trip; it does not close the circuit.
            CircuitState::Open => {}
        }
    }

    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self, now: Instant) -> bool {
        let mut g = self.inner.lock().expect("circuit lock poisoned");
        match g.state {
            CircuitState::Closed => {
                // Failures outside the window restart the count.
                let window_expired = g
                    .first_failure_at
                    .map(|t| now.saturating_duration_since(t) > self.cfg.window)
                    .unwrap_or(true);
                if window_expired {
                    g.consecutive_failures = 1;
                    g.first_failure_at = Some(now);
                } else {
                    g.consecutive_failures += 1;
                }

                if g.consecutive_failures >= self.cfg.failure_threshold {
                    warn!(target = %self.target, failures = g.consecutive_failures, "circuit opened");
                    g.state = CircuitState::Open;
                    g.opened_at = Some(now);
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                warn!(target = %self.target, "half-open probe failed; circuit re-opened");
                g.state = CircuitState::Open;
                g.opened_at = Some(now);
                g.probes_in_flight = 0;
                g.probe_successes = 0;
                true
            }
            CircuitState::Open => false,
        }
    }
}

/// One breaker per target, created on first use.
pub struct CircuitRegistry {
    cfg: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_target(&self, target: &str) -> Arc<CircuitBreaker> {
        let mut g = self.breakers.lock().expect("registry lock poisoned");
        g.entry(target.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.cfg)))
            .clone()
    }

    /// Number of circuits currently not closed (gauge source).
    pub fn open_count(&self) -> usize {
        let g = self.breakers.lock().expect("registry lock poisoned");
        g.values()
            .filter(|b| b.state() != CircuitState::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }

    #[test]
    fn opens_after_n_failures_in_window() {
        let cb = CircuitBreaker::new("messenger", cfg());
        let t0 = Instant::now();

        for i in 0..5 {
            cb.try_admit(t0).unwrap();
            cb.record_failure(t0 + Duration::from_secs(i));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_admit(t0 + Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.target, "messenger");
        assert!(err.retry_after > Duration::ZERO);
    }

    #[test]
    fn failures_outside_window_do_not_trip() {
        let cb = CircuitBreaker::new("t", cfg());
        let t0 = Instant::now();

        for i in 0..4 {
            cb.record_failure(t0 + Duration::from_secs(i));
        }
        // Window expires; the next failure restarts the count at 1.
        cb.record_failure(t0 + Duration::from_secs(120));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn success_resets_consecutive_count() {
        let cb = CircuitBreaker::new("t", cfg());
        let t0 = Instant::now();

        for i in 0..4 {
            cb.record_failure(t0 + Duration::from_secs(i));
        }
        cb.record_success(t0 + Duration::from_secs(4));
        cb.record_failure(t0 + Duration::from_secs(5));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_cooldown_then_closes_on_probe_successes() {
        let cb = CircuitBreaker::new("t", cfg());
        let t0 = Instant::now();
        for _ in 0..5 {
            cb.record_failure(t0);
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Before cooldown: rejected.
        assert!(cb.try_admit(t0 + Duration::from_secs(29)).is_err());

        // After cooldown: probe admitted.
        let t1 = t0 + Duration::from_secs(30);
        cb.try_admit(t1).unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Second probe fits (P=2); a third is rejected while both in flight.
        cb.try_admit(t1).unwrap();
        assert!(cb.try_admit(t1).is_err());

        cb.record_success(t1);
        cb.record_success(t1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let cb = CircuitBreaker::new("t", cfg());
        let t0 = Instant::now();
        for _ in 0..5 {
            cb.record_failure(t0);
        }
        let t1 = t0 + Duration::from_secs(30);
        cb.try_admit(t1).unwrap();
        cb.record_failure(t1);
        assert_eq!(cb.state(), CircuitState::Open);

        // Full cooldown applies again from the re-open.
        assert!(cb.try_admit(t1 + Duration::from_secs(29)).is_err());
        assert!(cb.try_admit(t1 + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn registry_counts_open_circuits() {
        let reg = CircuitRegistry::new(cfg());
        let t0 = Instant::now();

        let a = reg.for_target("a");
        let _b = reg.for_target("b");
        for _ in 0..5 {
            a.record_failure(t0);
        }

        assert_eq!(reg.open_count(), 1);
        // Same target returns the same breaker.
        assert_eq!(reg.for_target("a").state(), CircuitState::Open);
    }
}
