//! Dead letter queue rows and controlled replay.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use swb_schemas::ErrorCategory;

#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub original_request_id: Uuid,
    pub failure_reason: String,
    pub failure_category: ErrorCategory,
    pub retry_count: i32,
    pub original_payload: Value,
    pub error_details: Value,
}

#[derive(Debug, Clone)]
pub struct DeadLetterRow {
    pub id: Uuid,
    pub original_request_id: Uuid,
    pub source_table: String,
    pub failure_reason: String,
    pub failure_category: ErrorCategory,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub original_payload: Value,
    pub error_details: Value,
    pub replay_eligible: bool,
    pub replayed_at: Option<DateTime<Utc>>,
    pub replayed_request_id: Option<Uuid>,
    pub replay_outcome: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Why a replay request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    NotFound(Uuid),
    /// `replay_eligible = false`: the row is pinned.
    NotEligible(Uuid),
    /// Replay already recorded; a DLQ row replays exactly once.
    AlreadyReplayed(Uuid),
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::NotFound(id) => write!(f, "dlq row {id} not found"),
            ReplayError::NotEligible(id) => write!(f, "dlq row {id} is not replay-eligible"),
            ReplayError::AlreadyReplayed(id) => write!(f, "already_replayed: dlq row {id}"),
        }
    }
}

impl std::error::Error for ReplayError {}

pub async fn insert_dead_letter(pool: &PgPool, dl: &NewDeadLetter) -> Result<Uuid> {
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into dead_letter_queue (
            original_request_id, failure_reason, failure_category,
            retry_count, last_retry_at, original_payload, error_details
        ) values ($1, $2, $3, $4, now(), $5, $6)
        returning id
        "#,
    )
    .bind(dl.original_request_id)
    .bind(&dl.failure_reason)
    .bind(dl.failure_category.as_str())
    .bind(dl.retry_count)
    .bind(&dl.original_payload)
    .bind(&dl.error_details)
    .fetch_one(pool)
    .await
    .context("insert_dead_letter failed")?;

    Ok(id)
}

pub async fn fetch_dead_letter(pool: &PgPool, dlq_id: Uuid) -> Result<Option<DeadLetterRow>> {
    let row = sqlx::query(
        r#"
        select id, original_request_id, source_table, failure_reason,
               failure_category, retry_count, last_retry_at, original_payload,
               error_details, replay_eligible, replayed_at,
               replayed_request_id, replay_outcome, created_at
        from dead_letter_queue
        where id = $1
        "#,
    )
    .bind(dlq_id)
    .fetch_optional(pool)
    .await
    .context("fetch_dead_letter failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(map_row(row)?))
}

/// Rows still eligible for replay, oldest first.
pub async fn list_replayable(pool: &PgPool, limit: i64) -> Result<Vec<DeadLetterRow>> {
    let rows = sqlx::query(
        r#"
        select id, original_request_id, source_table, failure_reason,
               failure_category, retry_count, last_retry_at, original_payload,
               error_details, replay_eligible, replayed_at,
               replayed_request_id, replay_outcome, created_at
        from dead_letter_queue
        where replay_eligible = true
          and replayed_at is null
        order by created_at asc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_replayable failed")?;

    rows.into_iter().map(map_row).collect()
}

/// Stamp the replay fields exactly once.
///
/// The guard (`replayed_at IS NULL AND replay_eligible`) runs inside the
/// UPDATE, so two racing operators cannot both succeed. When the update
/// matches nothing, the row is re-read to report the precise refusal.
pub async fn mark_replayed(
    pool: &PgPool,
    dlq_id: Uuid,
    replayed_request_id: Uuid,
    outcome: &str,
) -> Result<std::result::Result<(), ReplayError>> {
    let res = sqlx::query(
        r#"
        update dead_letter_queue
           set replayed_at = now(),
               replayed_request_id = $1,
               replay_outcome = $2
         where id = $3
           and replayed_at is null
           and replay_eligible = true
        "#,
    )
    .bind(replayed_request_id)
    .bind(outcome)
    .bind(dlq_id)
    .execute(pool)
    .await
    .context("mark_replayed update failed")?;

    if res.rows_affected() > 0 {
        return Ok(Ok(()));
    }

    let refusal = match fetch_dead_letter(pool, dlq_id).await? {
        None => ReplayError::NotFound(dlq_id),
        Some(row) if row.replayed_at.is_some() => ReplayError::AlreadyReplayed(dlq_id),
        Some(_) => ReplayError::NotEligible(dlq_id),
    };
    Ok(Err(refusal))
}

fn map_row(row: sqlx::postgres::PgRow) -> Result<DeadLetterRow> {
    let category_str: String = row.try_get("failure_category")?;
    let failure_category = ErrorCategory::parse(&category_str)
        .ok_or_else(|| anyhow::anyhow!("invalid failure_category in row: {category_str}"))?;

    Ok(DeadLetterRow {
        id: row.try_get("id")?,
        original_request_id: row.try_get("original_request_id")?,
        source_table: row.try_get("source_table")?,
        failure_reason: row.try_get("failure_reason")?,
        failure_category,
        retry_count: row.try_get("retry_count")?,
        last_retry_at: row.try_get("last_retry_at")?,
        original_payload: row.try_get("original_payload")?,
        error_details: row.try_get("error_details")?,
        replay_eligible: row.try_get("replay_eligible")?,
        replayed_at: row.try_get("replayed_at")?,
        replayed_request_id: row.try_get("replayed_request_id")?,
        replay_outcome: row.try_get("replay_outcome")?,
        created_at: row.try_get("created_at")?,
    })
}
