//! Operator audit log. Rows are INSERT-only; the migration installs a
//! trigger that rejects UPDATE and DELETE at the database level.

use anyhow::{ensure, Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Manual interventions an operator can perform. String forms match the
/// `valid_action_type` check constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorAction {
    ManualReroute,
    CancelRequest,
    AbortRequest,
    ControlledReplay,
    ControlledRetry,
    ForceComplete,
}

impl OperatorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorAction::ManualReroute => "manual_reroute",
            OperatorAction::CancelRequest => "cancel_request",
            OperatorAction::AbortRequest => "abort_request",
            OperatorAction::ControlledReplay => "controlled_replay",
            OperatorAction::ControlledRetry => "controlled_retry",
            OperatorAction::ForceComplete => "force_complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failed,
    Rejected,
    Partial,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failed => "failed",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewOperatorAudit {
    pub action_type: OperatorAction,
    pub target_request_id: Uuid,
    pub target_table: String,
    pub operator_identity: String,
    pub reason: String,
    pub action_payload: Value,
    pub outcome: AuditOutcome,
    pub outcome_details: Value,
}

/// Append one audit row. Identity and a non-empty reason are mandatory,
/// refused here before the DB constraint ever sees it.
pub async fn insert_operator_audit(pool: &PgPool, entry: &NewOperatorAudit) -> Result<Uuid> {
    ensure!(
        !entry.operator_identity.trim().is_empty(),
        "operator_identity is required for audit entries"
    );
    ensure!(
        !entry.reason.trim().is_empty(),
        "a non-empty reason is required for audit entries"
    );

    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into operator_audit_log (
            action_type, target_request_id, target_table,
            operator_identity, reason, action_payload,
            outcome, outcome_details
        ) values ($1, $2, $3, $4, $5, $6, $7, $8)
        returning id
        "#,
    )
    .bind(entry.action_type.as_str())
    .bind(entry.target_request_id)
    .bind(&entry.target_table)
    .bind(&entry.operator_identity)
    .bind(&entry.reason)
    .bind(&entry.action_payload)
    .bind(entry.outcome.as_str())
    .bind(&entry.outcome_details)
    .fetch_one(pool)
    .await
    .context("insert_operator_audit failed")?;

    Ok(id)
}
