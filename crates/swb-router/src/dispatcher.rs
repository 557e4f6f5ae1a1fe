//! Reliability-wrapped dispatch of one `route.v1` call to one target.
//!
//! Order of gates per attempt: circuit admission, token bucket, per-channel
//! timeout around the sink call. Failures are mapped onto the error
//! taxonomy and retried per policy; the returned outcome is terminal for
//! this dispatch (the caller decides about the DLQ).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use swb_config::TimeoutSettings;
use swb_reliability::{CircuitRegistry, RateLimiter, RetryPolicy};
use swb_schemas::{DispatchOutcome, ErrorCategory, PolicyTier, RouteRequestV1};
use swb_telemetry::{SwitchboardMetrics, TargetLabels};

use crate::cancel::CancelToken;
use crate::sink::{ButlerSink, SinkError};

pub struct TargetDispatcher {
    sink: Arc<dyn ButlerSink>,
    circuits: Arc<CircuitRegistry>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    timeouts: TimeoutSettings,
    metrics: Option<Arc<SwitchboardMetrics>>,
}

/// How long a rate-limited attempt waits between admission polls.
const BUCKET_POLL: Duration = Duration::from_millis(50);

impl TargetDispatcher {
    pub fn new(
        sink: Arc<dyn ButlerSink>,
        circuits: Arc<CircuitRegistry>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        timeouts: TimeoutSettings,
    ) -> Self {
        Self {
            sink,
            circuits,
            limiter,
            retry,
            timeouts,
            metrics: None,
        }
    }

    /// Attach the metrics registry (retry + circuit-trip counters).
    pub fn with_metrics(mut self, metrics: Arc<SwitchboardMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    fn count_retry(&self, target: &str) {
        if let Some(m) = &self.metrics {
            m.retries
                .get_or_create(&TargetLabels { destination_butler: target.to_string() })
                .inc();
        }
    }

    fn count_circuit_trip(&self, target: &str, opened: bool) {
        if !opened {
            return;
        }
        if let Some(m) = &self.metrics {
            m.circuit_opened
                .get_or_create(&TargetLabels { destination_butler: target.to_string() })
                .inc();
        }
    }

    /// Dispatch with retries. `request.attempt` is updated per attempt so the
    /// target sees an honest counter.
    pub async fn dispatch(
        &self,
        endpoint_url: &str,
        mut request: RouteRequestV1,
        channel: &str,
        tier: PolicyTier,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> DispatchOutcome {
        let target = request.target.clone();
        let breaker = self.circuits.for_target(&target);
        let timeout = self.timeouts.for_channel(channel);

        let mut attempt: u32 = 0;
        let mut last = outcome_failure(&target, ErrorCategory::Unknown, None, "not attempted");

        loop {
            attempt += 1;
            request.attempt = attempt;
            request.deadline_ms = remaining_ms(deadline);

            if cancel.is_cancelled() {
                return outcome_failure(&target, ErrorCategory::Unknown, None, "cancelled");
            }
            if request.deadline_ms <= 0 {
                return outcome_failure(&target, ErrorCategory::Timeout, None, "deadline exhausted");
            }

            // Gate 1: token bucket. Bulk is rejected outright; higher tiers
            // wait for a token inside the deadline. Checked before the
            // circuit so a rate refusal leaves breaker state untouched.
            if !self.admit_rate(&target, tier, deadline, cancel).await {
                let category = if tier == PolicyTier::Bulk {
                    ErrorCategory::Overload
                } else {
                    ErrorCategory::Timeout
                };
                return outcome_failure(&target, category, None, "rate limit");
            }

            // Gate 2: circuit.
            let (result, retry_after) = match breaker.try_admit_now() {
                Err(open) => {
                    last = outcome_failure(
                        &target,
                        ErrorCategory::CircuitOpen,
                        None,
                        &open.to_string(),
                    );
                    (None, Some(open.retry_after))
                }
                Ok(()) => {
                    // Gate 3: bounded call.
                    let started = Instant::now();
                    let call = self.sink.dispatch(endpoint_url, &request);
                    let result = tokio::select! {
                        r = tokio::time::timeout(timeout, call) => match r {
                            Ok(inner) => inner,
                            Err(_) => Err(SinkError::Timeout),
                        },
                        _ = cancel.cancelled() => {
                            return outcome_failure(&target, ErrorCategory::Unknown, None, "cancelled");
                        }
                    };
                    let elapsed = started.elapsed().as_millis() as i64;
                    (Some((result, elapsed)), None)
                }
            };

            match result {
                Some((Ok(resp), elapsed)) if resp.success => {
                    breaker.record_success_now();
                    return DispatchOutcome {
                        butler: target,
                        success: true,
                        duration_ms: if resp.duration_ms > 0 { resp.duration_ms } else { elapsed },
                        error_category: None,
                        http_status: Some(200),
                    };
                }
                Some((Ok(resp), elapsed)) => {
                    // Target answered but reported failure.
                    let opened = breaker.record_failure_now();
                    self.count_circuit_trip(&target, opened);
                    let category = resp.error_category.unwrap_or(ErrorCategory::DownstreamFailure);
                    last = DispatchOutcome {
                        butler: target.clone(),
                        success: false,
                        duration_ms: elapsed,
                        error_category: Some(category),
                        http_status: Some(200),
                    };
                    if !category.is_retriable() {
                        return last;
                    }
                }
                Some((Err(err), elapsed)) => {
                    let opened = breaker.record_failure_now();
                    self.count_circuit_trip(&target, opened);
                    let (category, status, hint) = classify_sink_error(&err);
                    last = DispatchOutcome {
                        butler: target.clone(),
                        success: false,
                        duration_ms: elapsed,
                        error_category: Some(category),
                        http_status: status,
                    };
                    if !category.is_retriable() {
                        return last;
                    }
                    if let Some(hint) = hint {
                        if !self.backoff_or_give_up(attempt, Some(hint), deadline, cancel).await {
                            return exhausted(last);
                        }
                        self.count_retry(&target);
                        continue;
                    }
                }
                // Circuit rejected: no call happened, no breaker update.
                None => {}
            }

            if !self
                .backoff_or_give_up(attempt, retry_after, deadline, cancel)
                .await
            {
                return exhausted(last);
            }
            self.count_retry(&target);
        }
    }

    /// Sleep the policy backoff if another attempt is allowed and fits the
    /// deadline. Returns false when the dispatch should stop.
    async fn backoff_or_give_up(
        &self,
        attempt: u32,
        retry_after: Option<Duration>,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> bool {
        if !self.retry.retries_remain(attempt) {
            return false;
        }

        let wait = self.retry.backoff(attempt, retry_after);
        if Instant::now() + wait >= deadline {
            debug!("backoff {wait:?} would overrun the request deadline");
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Token-bucket admission. Non-bulk tiers poll until a token appears or
    /// the deadline/cancel fires; bulk gets exactly one try.
    async fn admit_rate(
        &self,
        target: &str,
        tier: PolicyTier,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> bool {
        if self.limiter.try_admit(target, tier) {
            return true;
        }
        if tier == PolicyTier::Bulk {
            return false;
        }

        loop {
            let poll = tokio::time::sleep(BUCKET_POLL);
            tokio::select! {
                _ = poll => {}
                _ = cancel.cancelled() => return false,
            }
            if Instant::now() >= deadline {
                return false;
            }
            if self.limiter.try_admit(target, tier) {
                return true;
            }
        }
    }
}

fn remaining_ms(deadline: Instant) -> i64 {
    deadline
        .saturating_duration_since(Instant::now())
        .as_millis() as i64
}

fn classify_sink_error(err: &SinkError) -> (ErrorCategory, Option<u16>, Option<Duration>) {
    match err {
        SinkError::Timeout => (ErrorCategory::Timeout, None, None),
        SinkError::Connect(_) => (ErrorCategory::DownstreamFailure, None, None),
        SinkError::Status { code, retry_after } => {
            let category = match code {
                429 | 503 => ErrorCategory::DownstreamFailure,
                500..=599 => ErrorCategory::DownstreamFailure,
                400 | 422 => ErrorCategory::ValidationError,
                403 => ErrorCategory::PolicyViolation,
                _ => ErrorCategory::Unknown,
            };
            (category, Some(*code), *retry_after)
        }
        SinkError::BadResponse(_) => (ErrorCategory::DownstreamFailure, None, None),
    }
}

fn outcome_failure(
    target: &str,
    category: ErrorCategory,
    http_status: Option<u16>,
    reason: &str,
) -> DispatchOutcome {
    debug!(target, %category, reason, "dispatch attempt failed");
    DispatchOutcome {
        butler: target.to_string(),
        success: false,
        duration_ms: 0,
        error_category: Some(category),
        http_status,
    }
}

/// Retry budget spent: the outcome keeps its proximate category; the caller
/// records exhaustion when filing the DLQ row.
fn exhausted(last: DispatchOutcome) -> DispatchOutcome {
    if last.error_category.map(|c| c.is_retriable()).unwrap_or(false) {
        warn!(target = %last.butler, category = ?last.error_category, "retry budget exhausted");
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use swb_reliability::CircuitBreakerConfig;
    use swb_schemas::{DispatchResponse, SCHEMA_ROUTE_V1};
    use uuid::Uuid;

    struct ScriptedSink {
        /// Status codes to fail with, in order; success after the script ends.
        script: Vec<u16>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ButlerSink for ScriptedSink {
        async fn dispatch(
            &self,
            _endpoint_url: &str,
            _request: &RouteRequestV1,
        ) -> Result<DispatchResponse, SinkError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.script.get(n) {
                Some(code) => Err(SinkError::Status {
                    code: *code,
                    retry_after: None,
                }),
                None => Ok(DispatchResponse {
                    success: true,
                    duration_ms: 5,
                    error: None,
                    error_category: None,
                }),
            }
        }
    }

    fn dispatcher(sink: Arc<dyn ButlerSink>, max_attempts: u32) -> TargetDispatcher {
        TargetDispatcher::new(
            sink,
            Arc::new(CircuitRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(RateLimiter::new(|_| (1000.0, 1000.0))),
            RetryPolicy::new(max_attempts, 1, 5),
            TimeoutSettings::default(),
        )
    }

    fn request(target: &str) -> RouteRequestV1 {
        RouteRequestV1 {
            schema_version: SCHEMA_ROUTE_V1.to_string(),
            request_id: Uuid::new_v4(),
            target: target.to_string(),
            prompt: None,
            prompt_version: None,
            context: serde_json::json!({}),
            deadline_ms: 0,
            attempt: 0,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn retries_5xx_until_success() {
        let sink = Arc::new(ScriptedSink {
            script: vec![500, 502],
            calls: AtomicU32::new(0),
        });
        let d = dispatcher(sink.clone(), 3);

        let out = d
            .dispatch(
                "http://x",
                request("general"),
                "telegram",
                PolicyTier::Default,
                deadline(),
                &CancelToken::never(),
            )
            .await;

        assert!(out.success);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_last_retriable_category() {
        let sink = Arc::new(ScriptedSink {
            script: vec![500, 500, 500, 500],
            calls: AtomicU32::new(0),
        });
        let d = dispatcher(sink.clone(), 3);

        let out = d
            .dispatch(
                "http://x",
                request("general"),
                "telegram",
                PolicyTier::Default,
                deadline(),
                &CancelToken::never(),
            )
            .await;

        assert!(!out.success);
        assert_eq!(out.error_category, Some(ErrorCategory::DownstreamFailure));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3, "retry budget is bounded");
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let sink = Arc::new(ScriptedSink {
            script: vec![400, 400],
            calls: AtomicU32::new(0),
        });
        let d = dispatcher(sink.clone(), 3);

        let out = d
            .dispatch(
                "http://x",
                request("general"),
                "telegram",
                PolicyTier::Default,
                deadline(),
                &CancelToken::never(),
            )
            .await;

        assert!(!out.success);
        assert_eq!(out.error_category, Some(ErrorCategory::ValidationError));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1, "non-retriable: one call only");
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling_sink() {
        let sink = Arc::new(ScriptedSink {
            script: vec![],
            calls: AtomicU32::new(0),
        });
        let circuits = Arc::new(CircuitRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            half_open_probes: 1,
        }));
        circuits.for_target("general").record_failure_now();

        let d = TargetDispatcher::new(
            sink.clone(),
            circuits,
            Arc::new(RateLimiter::new(|_| (1000.0, 1000.0))),
            RetryPolicy::new(1, 1, 5),
            TimeoutSettings::default(),
        );

        let out = d
            .dispatch(
                "http://x",
                request("general"),
                "telegram",
                PolicyTier::Default,
                deadline(),
                &CancelToken::never(),
            )
            .await;

        assert!(!out.success);
        assert_eq!(out.error_category, Some(ErrorCategory::CircuitOpen));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 0, "fast-reject must not reach the sink");
    }

    #[tokio::test]
    async fn bulk_rate_rejection_is_overload() {
        let sink = Arc::new(ScriptedSink {
            script: vec![],
            calls: AtomicU32::new(0),
        });
        let d = TargetDispatcher::new(
            sink,
            Arc::new(CircuitRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(RateLimiter::new(|_| (0.0, 0.0))),
            RetryPolicy::new(1, 1, 5),
            TimeoutSettings::default(),
        );

        let out = d
            .dispatch(
                "http://x",
                request("general"),
                "telegram",
                PolicyTier::Bulk,
                deadline(),
                &CancelToken::never(),
            )
            .await;

        assert!(!out.success);
        assert_eq!(out.error_category, Some(ErrorCategory::Overload));
    }

    #[tokio::test]
    async fn cancellation_stops_the_dispatch() {
        let sink = Arc::new(ScriptedSink {
            script: vec![500, 500, 500, 500, 500],
            calls: AtomicU32::new(0),
        });
        let d = dispatcher(sink, 5);

        let (source, token) = crate::cancel::cancel_pair();
        source.cancel();

        let out = d
            .dispatch(
                "http://x",
                request("general"),
                "telegram",
                PolicyTier::Default,
                deadline(),
                &token,
            )
            .await;
        assert!(!out.success);
    }
}
