//! Fanout execution: one route decision, N targets, join/abort policies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::debug;
use uuid::Uuid;

use swb_schemas::{
    AbortPolicy, DispatchOutcome, ErrorCategory, FanoutMode, JoinPolicy, PolicyTier,
    RouteDecision, RouteRequestV1, RouteTarget, SCHEMA_ROUTE_V1,
};

use crate::cancel::CancelToken;
use crate::dispatcher::TargetDispatcher;

/// Everything the fanout needs for one request.
pub struct FanoutPlan {
    pub request_id: Uuid,
    pub decision: RouteDecision,
    pub channel: String,
    pub tier: PolicyTier,
    /// Shared `route.v1` context (envelope summary, provenance).
    pub context: Value,
    pub deadline: Instant,
}

/// Aggregated verdict under the join/abort rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Join satisfied, zero failures.
    Success,
    /// Join satisfied despite some failures (e.g. quorum met).
    Partial,
    Failure,
}

#[derive(Debug)]
pub struct FanoutResult {
    pub disposition: Disposition,
    /// Outcomes for every target that was actually attempted, in declared
    /// order. Targets skipped by an abort or early join do not appear.
    pub outcomes: Vec<DispatchOutcome>,
}

fn route_request(plan: &FanoutPlan, target: &RouteTarget) -> RouteRequestV1 {
    RouteRequestV1 {
        schema_version: SCHEMA_ROUTE_V1.to_string(),
        request_id: plan.request_id,
        target: target.butler.clone(),
        prompt: target.prompt.clone(),
        prompt_version: target.prompt_version.clone(),
        context: plan.context.clone(),
        deadline_ms: 0,
        attempt: 0,
    }
}

fn unknown_target_outcome(target: &str) -> DispatchOutcome {
    DispatchOutcome {
        butler: target.to_string(),
        success: false,
        duration_ms: 0,
        error_category: Some(ErrorCategory::ValidationError),
        http_status: None,
    }
}

fn join_satisfied(join: JoinPolicy, successes: usize, total_targets: usize) -> bool {
    match join {
        JoinPolicy::All => successes == total_targets,
        JoinPolicy::FirstSuccess => successes >= 1,
        JoinPolicy::Quorum { k } => successes >= k as usize,
    }
}

fn should_abort(abort: AbortPolicy, failures: usize) -> bool {
    match abort {
        AbortPolicy::StopOnFirstError => failures >= 1,
        AbortPolicy::Continue => false,
        AbortPolicy::Threshold { k } => failures >= k as usize,
    }
}

/// Early exit once the join can no longer be hurt by waiting: first-success
/// and quorum stop as soon as they are satisfied; `all` always runs out.
fn join_early_exit(join: JoinPolicy, successes: usize) -> bool {
    match join {
        JoinPolicy::All => false,
        JoinPolicy::FirstSuccess => successes >= 1,
        JoinPolicy::Quorum { k } => successes >= k as usize,
    }
}

/// Execute a route decision. `endpoints` maps butler name to endpoint URL,
/// resolved by the caller from the registry snapshot; a target without an
/// entry is an unknown-target routing error, never an implicit creation.
pub async fn execute_fanout(
    dispatcher: Arc<TargetDispatcher>,
    endpoints: &HashMap<String, String>,
    plan: &FanoutPlan,
    cancel: &CancelToken,
) -> FanoutResult {
    let total = plan.decision.targets.len();
    let outcomes = match plan.decision.fanout_mode {
        FanoutMode::Sequential => run_sequential(&dispatcher, endpoints, plan, cancel).await,
        FanoutMode::Parallel => run_parallel(dispatcher, endpoints, plan, cancel).await,
    };

    let successes = outcomes.iter().filter(|o| o.success).count();
    let failures = outcomes.iter().filter(|o| !o.success).count();

    let disposition = if join_satisfied(plan.decision.join_policy, successes, total) {
        if failures == 0 {
            Disposition::Success
        } else {
            Disposition::Partial
        }
    } else {
        Disposition::Failure
    };

    debug!(
        request_id = %plan.request_id,
        ?disposition,
        successes,
        failures,
        "fanout complete"
    );

    FanoutResult {
        disposition,
        outcomes,
    }
}

async fn run_sequential(
    dispatcher: &TargetDispatcher,
    endpoints: &HashMap<String, String>,
    plan: &FanoutPlan,
    cancel: &CancelToken,
) -> Vec<DispatchOutcome> {
    let mut outcomes = Vec::with_capacity(plan.decision.targets.len());
    let mut successes = 0usize;
    let mut failures = 0usize;

    for target in &plan.decision.targets {
        if cancel.is_cancelled() {
            break;
        }

        let outcome = match endpoints.get(&target.butler) {
            None => unknown_target_outcome(&target.butler),
            Some(url) => {
                dispatcher
                    .dispatch(
                        url,
                        route_request(plan, target),
                        &plan.channel,
                        plan.tier,
                        plan.deadline,
                        cancel,
                    )
                    .await
            }
        };

        if outcome.success {
            successes += 1;
        } else {
            failures += 1;
        }
        outcomes.push(outcome);

        if join_early_exit(plan.decision.join_policy, successes) {
            break;
        }
        if should_abort(plan.decision.abort_policy, failures) {
            break;
        }
    }

    outcomes
}

async fn run_parallel(
    dispatcher: Arc<TargetDispatcher>,
    endpoints: &HashMap<String, String>,
    plan: &FanoutPlan,
    cancel: &CancelToken,
) -> Vec<DispatchOutcome> {
    let mut set: JoinSet<(usize, DispatchOutcome)> = JoinSet::new();
    let mut indexed: Vec<Option<DispatchOutcome>> = Vec::new();
    indexed.resize_with(plan.decision.targets.len(), || None);

    for (idx, target) in plan.decision.targets.iter().enumerate() {
        match endpoints.get(&target.butler) {
            None => {
                indexed[idx] = Some(unknown_target_outcome(&target.butler));
            }
            Some(url) => {
                let dispatcher = Arc::clone(&dispatcher);
                let url = url.clone();
                let request = route_request(plan, target);
                let channel = plan.channel.clone();
                let tier = plan.tier;
                let deadline = plan.deadline;
                let cancel = cancel.clone();
                set.spawn(async move {
                    let outcome = dispatcher
                        .dispatch(&url, request, &channel, tier, deadline, &cancel)
                        .await;
                    (idx, outcome)
                });
            }
        }
    }

    let mut successes = indexed.iter().flatten().filter(|o| o.success).count();
    let mut failures = indexed.iter().flatten().filter(|o| !o.success).count();

    while let Some(joined) = set.join_next().await {
        let Ok((idx, outcome)) = joined else {
            // A task aborted by early exit below; nothing to record.
            continue;
        };
        if outcome.success {
            successes += 1;
        } else {
            failures += 1;
        }
        indexed[idx] = Some(outcome);

        // Join satisfied or abort tripped: cancel the rest, best-effort.
        if join_early_exit(plan.decision.join_policy, successes)
            || should_abort(plan.decision.abort_policy, failures)
        {
            set.abort_all();
        }
    }

    indexed.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use swb_config::TimeoutSettings;
    use swb_reliability::{CircuitBreakerConfig, CircuitRegistry, RateLimiter, RetryPolicy};
    use swb_schemas::{DispatchResponse, ParseSource};

    use crate::sink::{ButlerSink, SinkError};

    /// Sink scripted per target: Some(code) fails with that status, None succeeds.
    struct PerTargetSink {
        failures: HashMap<String, u16>,
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl PerTargetSink {
        fn new() -> Self {
            Self {
                failures: HashMap::new(),
                delays: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ButlerSink for PerTargetSink {
        async fn dispatch(
            &self,
            _endpoint_url: &str,
            request: &RouteRequestV1,
        ) -> Result<DispatchResponse, SinkError> {
            self.calls.lock().unwrap().push(request.target.clone());
            if let Some(delay) = self.delays.get(&request.target) {
                tokio::time::sleep(*delay).await;
            }
            match self.failures.get(&request.target) {
                Some(code) => Err(SinkError::Status {
                    code: *code,
                    retry_after: None,
                }),
                None => Ok(DispatchResponse {
                    success: true,
                    duration_ms: 1,
                    error: None,
                    error_category: None,
                }),
            }
        }
    }

    fn dispatcher(sink: Arc<PerTargetSink>) -> Arc<TargetDispatcher> {
        Arc::new(TargetDispatcher::new(
            sink,
            Arc::new(CircuitRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(RateLimiter::new(|_| (1000.0, 1000.0))),
            RetryPolicy::new(1, 1, 5),
            TimeoutSettings::default(),
        ))
    }

    fn endpoints(names: &[&str]) -> HashMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), format!("http://{n}.local/route")))
            .collect()
    }

    fn plan(targets: &[&str], mode: FanoutMode, join: JoinPolicy, abort: AbortPolicy) -> FanoutPlan {
        FanoutPlan {
            request_id: Uuid::new_v4(),
            decision: RouteDecision {
                targets: targets.iter().map(|t| RouteTarget::named(*t)).collect(),
                fanout_mode: mode,
                join_policy: join,
                abort_policy: abort,
                parse_source: ParseSource::Classifier,
            },
            channel: "telegram".to_string(),
            tier: PolicyTier::Default,
            context: serde_json::json!({}),
            deadline: Instant::now() + Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn sequential_stop_on_first_error_skips_remaining() {
        let mut sink = PerTargetSink::new();
        sink.failures.insert("general".to_string(), 500);
        let sink = Arc::new(sink);

        let result = execute_fanout(
            dispatcher(sink.clone()),
            &endpoints(&["general", "messenger"]),
            &plan(
                &["general", "messenger"],
                FanoutMode::Sequential,
                JoinPolicy::All,
                AbortPolicy::StopOnFirstError,
            ),
            &CancelToken::never(),
        )
        .await;

        assert_eq!(result.disposition, Disposition::Failure);
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].butler, "general");
        assert!(!result.outcomes[0].success);
        assert_eq!(sink.calls(), vec!["general"], "messenger must not be called");
    }

    #[tokio::test]
    async fn parallel_continue_collects_all_outcomes() {
        let mut sink = PerTargetSink::new();
        sink.failures.insert("messenger".to_string(), 500);
        let sink = Arc::new(sink);

        let result = execute_fanout(
            dispatcher(sink.clone()),
            &endpoints(&["general", "messenger", "memory"]),
            &plan(
                &["general", "messenger", "memory"],
                FanoutMode::Parallel,
                JoinPolicy::All,
                AbortPolicy::Continue,
            ),
            &CancelToken::never(),
        )
        .await;

        assert_eq!(result.disposition, Disposition::Failure);
        assert_eq!(result.outcomes.len(), 3);
        let mut called = sink.calls();
        called.sort();
        assert_eq!(called, vec!["general", "memory", "messenger"]);
    }

    #[tokio::test]
    async fn unanimous_success_is_success() {
        let sink = Arc::new(PerTargetSink::new());
        let result = execute_fanout(
            dispatcher(sink),
            &endpoints(&["a", "b"]),
            &plan(
                &["a", "b"],
                FanoutMode::Parallel,
                JoinPolicy::All,
                AbortPolicy::Continue,
            ),
            &CancelToken::never(),
        )
        .await;
        assert_eq!(result.disposition, Disposition::Success);
    }

    #[tokio::test]
    async fn quorum_succeeds_with_partial_failures() {
        let mut sink = PerTargetSink::new();
        sink.failures.insert("slow".to_string(), 500);
        let sink = Arc::new(sink);

        let result = execute_fanout(
            dispatcher(sink),
            &endpoints(&["a", "b", "slow"]),
            &plan(
                &["a", "b", "slow"],
                FanoutMode::Parallel,
                JoinPolicy::Quorum { k: 2 },
                AbortPolicy::Continue,
            ),
            &CancelToken::never(),
        )
        .await;

        assert_ne!(result.disposition, Disposition::Failure);
        assert!(result.outcomes.iter().filter(|o| o.success).count() >= 2);
    }

    #[tokio::test]
    async fn first_success_skips_later_sequential_targets() {
        let sink = Arc::new(PerTargetSink::new());
        let result = execute_fanout(
            dispatcher(sink.clone()),
            &endpoints(&["a", "b"]),
            &plan(
                &["a", "b"],
                FanoutMode::Sequential,
                JoinPolicy::FirstSuccess,
                AbortPolicy::Continue,
            ),
            &CancelToken::never(),
        )
        .await;

        assert_eq!(result.disposition, Disposition::Success);
        assert_eq!(sink.calls(), vec!["a"], "first success must stop the fanout");
    }

    #[tokio::test]
    async fn unknown_target_is_a_routing_error_not_a_call() {
        let sink = Arc::new(PerTargetSink::new());
        let result = execute_fanout(
            dispatcher(sink.clone()),
            &endpoints(&["known"]),
            &plan(
                &["known", "ghost"],
                FanoutMode::Sequential,
                JoinPolicy::All,
                AbortPolicy::Continue,
            ),
            &CancelToken::never(),
        )
        .await;

        assert_eq!(result.disposition, Disposition::Failure);
        let ghost = result.outcomes.iter().find(|o| o.butler == "ghost").unwrap();
        assert_eq!(ghost.error_category, Some(ErrorCategory::ValidationError));
        assert_eq!(sink.calls(), vec!["known"], "ghost must never reach the sink");
    }
}
