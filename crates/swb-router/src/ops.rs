//! Operator actions: reroute, cancel, replay, force-complete.
//!
//! Every action requires an operator identity and a non-empty reason and is
//! recorded in the append-only audit log, including refusals.

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

use swb_db::{AuditOutcome, NewOperatorAudit, OperatorAction, ReplayError};
use swb_schemas::{
    IngressEnvelope, LifecycleState, ParseSource, RouteDecision, RouteTarget,
};

use crate::cancel::CancelToken;
use crate::fanout::{execute_fanout, Disposition, FanoutPlan};
use crate::pipeline::{Pipeline, WorkItem};

/// Outcome surfaced to the CLI / HTTP operator surface.
#[derive(Debug, Clone)]
pub struct OperatorActionResult {
    pub outcome: AuditOutcome,
    pub detail: String,
    pub new_request_id: Option<Uuid>,
}

impl OperatorActionResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AuditOutcome::Success | AuditOutcome::Partial)
    }

    fn rejected(detail: impl Into<String>) -> Self {
        Self {
            outcome: AuditOutcome::Rejected,
            detail: detail.into(),
            new_request_id: None,
        }
    }
}

async fn audit(
    pipeline: &Pipeline,
    action: OperatorAction,
    target_request_id: Uuid,
    operator: &str,
    reason: &str,
    result: &OperatorActionResult,
) -> Result<()> {
    swb_db::insert_operator_audit(
        pipeline.pool(),
        &NewOperatorAudit {
            action_type: action,
            target_request_id,
            target_table: "message_inbox".to_string(),
            operator_identity: operator.to_string(),
            reason: reason.to_string(),
            action_payload: json!({ "new_request_id": result.new_request_id }),
            outcome: result.outcome,
            outcome_details: json!({ "detail": result.detail }),
        },
    )
    .await?;
    Ok(())
}

/// Cancel an in-flight request. Completed subroutes stay recorded.
pub async fn cancel_request(
    pipeline: &Pipeline,
    request_id: Uuid,
    operator: &str,
    reason: &str,
) -> Result<OperatorActionResult> {
    let result = if pipeline.active().cancel(request_id) {
        OperatorActionResult {
            outcome: AuditOutcome::Success,
            detail: "cancellation propagated to in-flight dispatch".to_string(),
            new_request_id: None,
        }
    } else {
        OperatorActionResult::rejected("request is not in flight on this instance")
    };

    audit(pipeline, OperatorAction::CancelRequest, request_id, operator, reason, &result).await?;
    Ok(result)
}

/// Force a stuck request into `completed`. Refused for terminal requests.
pub async fn force_complete(
    pipeline: &Pipeline,
    request_id: Uuid,
    operator: &str,
    reason: &str,
) -> Result<OperatorActionResult> {
    let record = swb_db::fetch_inbox_record(pipeline.pool(), request_id).await?;

    let result = if record.lifecycle_state.is_terminal() {
        OperatorActionResult::rejected(format!(
            "request already terminal: {}",
            record.lifecycle_state
        ))
    } else {
        swb_db::force_complete(pipeline.pool(), request_id).await?;
        info!(request_id = %request_id, operator, "request force-completed");
        OperatorActionResult {
            outcome: AuditOutcome::Success,
            detail: format!("forced from {}", record.lifecycle_state),
            new_request_id: None,
        }
    };

    audit(pipeline, OperatorAction::ForceComplete, request_id, operator, reason, &result).await?;
    Ok(result)
}

/// Re-dispatch a failed request to an operator-chosen target.
pub async fn reroute(
    pipeline: &Pipeline,
    dispatcher: Arc<crate::dispatcher::TargetDispatcher>,
    request_id: Uuid,
    new_target: &str,
    operator: &str,
    reason: &str,
) -> Result<OperatorActionResult> {
    let record = swb_db::fetch_inbox_record(pipeline.pool(), request_id).await?;

    if record.lifecycle_state != LifecycleState::Failed {
        let result = OperatorActionResult::rejected(format!(
            "reroute requires a failed request; state is {}",
            record.lifecycle_state
        ));
        audit(pipeline, OperatorAction::ManualReroute, request_id, operator, reason, &result)
            .await?;
        return Ok(result);
    }

    let envelope: IngressEnvelope = serde_json::from_value(record.envelope.clone())
        .context("stored envelope no longer parses")?;

    if !swb_db::transition_lifecycle(
        pipeline.pool(),
        request_id,
        LifecycleState::Failed,
        LifecycleState::Dispatching,
    )
    .await?
    {
        let result = OperatorActionResult::rejected("request changed state concurrently");
        audit(pipeline, OperatorAction::ManualReroute, request_id, operator, reason, &result)
            .await?;
        return Ok(result);
    }

    let decision = RouteDecision::single(RouteTarget::named(new_target), ParseSource::Fallback);
    let endpoints = pipeline.resolve_endpoints_for(&decision).await;
    let plan = FanoutPlan {
        request_id,
        decision,
        channel: envelope.source.channel.clone(),
        tier: envelope.control.policy_tier,
        context: json!({
            "text": envelope.text(),
            "sender": envelope.sender.identity,
            "rerouted_by": operator,
        }),
        deadline: Instant::now()
            + Duration::from_millis(pipeline.config().dispatch.deadline_default_ms),
    };

    let fanout = execute_fanout(dispatcher, &endpoints, &plan, &CancelToken::never()).await;
    pipeline
        .record_outcomes_for(request_id, &envelope, &fanout.outcomes)
        .await?;

    let result = match fanout.disposition {
        Disposition::Success | Disposition::Partial => {
            swb_db::transition_lifecycle(
                pipeline.pool(),
                request_id,
                LifecycleState::Dispatching,
                LifecycleState::Completed,
            )
            .await?;
            OperatorActionResult {
                outcome: AuditOutcome::Success,
                detail: format!("rerouted to {new_target}"),
                new_request_id: None,
            }
        }
        Disposition::Failure => {
            swb_db::transition_lifecycle(
                pipeline.pool(),
                request_id,
                LifecycleState::Dispatching,
                LifecycleState::Failed,
            )
            .await?;
            OperatorActionResult {
                outcome: AuditOutcome::Failed,
                detail: format!("reroute to {new_target} failed"),
                new_request_id: None,
            }
        }
    };

    audit(pipeline, OperatorAction::ManualReroute, request_id, operator, reason, &result).await?;
    Ok(result)
}

/// Replay a DLQ row as a new request with preserved lineage. A row replays
/// exactly once; the second attempt is rejected with `already_replayed`.
pub async fn replay(
    pipeline: &Pipeline,
    dlq_id: Uuid,
    operator: &str,
    reason: &str,
) -> Result<OperatorActionResult> {
    let Some(row) = swb_db::fetch_dead_letter(pipeline.pool(), dlq_id).await? else {
        // No target request id to anchor on; use the dlq id itself.
        let result = OperatorActionResult::rejected("dlq row not found");
        audit(pipeline, OperatorAction::ControlledReplay, dlq_id, operator, reason, &result)
            .await?;
        return Ok(result);
    };

    // Fast rejections before any row is written.
    if row.replayed_at.is_some() {
        let result = OperatorActionResult::rejected("already_replayed");
        audit(
            pipeline,
            OperatorAction::ControlledReplay,
            row.original_request_id,
            operator,
            reason,
            &result,
        )
        .await?;
        return Ok(result);
    }
    if !row.replay_eligible {
        let result = OperatorActionResult::rejected("replay_eligible=false");
        audit(
            pipeline,
            OperatorAction::ControlledReplay,
            row.original_request_id,
            operator,
            reason,
            &result,
        )
        .await?;
        return Ok(result);
    }

    let envelope: IngressEnvelope = match serde_json::from_value(row.original_payload.clone()) {
        Ok(env) => env,
        Err(e) => {
            let result =
                OperatorActionResult::rejected(format!("original payload no longer parses: {e}"));
            audit(
                pipeline,
                OperatorAction::ControlledReplay,
                row.original_request_id,
                operator,
                reason,
                &result,
            )
            .await?;
            return Ok(result);
        }
    };

    let new_request_id =
        swb_db::insert_replay(pipeline.pool(), &envelope, row.original_request_id, dlq_id).await?;

    let result = match swb_db::mark_replayed(pipeline.pool(), dlq_id, new_request_id, "success")
        .await?
    {
        Ok(()) => {
            pipeline.enqueue_replay(WorkItem {
                request_id: new_request_id,
                envelope,
            });
            info!(dlq_id = %dlq_id, new_request_id = %new_request_id, "dlq row replayed");
            OperatorActionResult {
                outcome: AuditOutcome::Success,
                detail: "replayed with preserved lineage".to_string(),
                new_request_id: Some(new_request_id),
            }
        }
        Err(refusal) => {
            // Lost a race after the pre-checks; neutralize the orphan row so
            // it never sits in `accepted` forever.
            swb_db::force_complete(pipeline.pool(), new_request_id).await?;
            match refusal {
                ReplayError::AlreadyReplayed(_) => {
                    OperatorActionResult::rejected("already_replayed")
                }
                ReplayError::NotEligible(_) => {
                    OperatorActionResult::rejected("replay_eligible=false")
                }
                ReplayError::NotFound(_) => OperatorActionResult::rejected("dlq row not found"),
            }
        }
    };

    audit(
        pipeline,
        OperatorAction::ControlledReplay,
        row.original_request_id,
        operator,
        reason,
        &result,
    )
    .await?;
    Ok(result)
}
