//! Inbox ingest, dedup, and lifecycle mutations.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use swb_schemas::{
    DispatchOutcome, IngestAccepted, IngressEnvelope, LifecycleState, NotifyRequestV1,
};

/// Derive the stable dedup key for an envelope.
///
/// `sha256(endpoint_identity \x1f sender_identity \x1f external_event_id)`:
/// no timestamps, no randomness, so re-submission always lands on the same
/// key. The unit separator keeps `("ab","c")` distinct from `("a","bc")`.
pub fn dedupe_key(env: &IngressEnvelope) -> String {
    let mut hasher = Sha256::new();
    hasher.update(env.source.endpoint_identity.as_bytes());
    hasher.update([0x1f]);
    hasher.update(env.sender.identity.as_bytes());
    hasher.update([0x1f]);
    hasher.update(env.event.external_event_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Idempotent accept: insert the envelope, or return the prior request id.
///
/// Three steps, each safe under concurrency:
/// 1. Recent-window lookup catches duplicates across partition boundaries
///    (the partial unique index only guards within a partition).
/// 2. `ON CONFLICT DO NOTHING ... RETURNING id`: the winner gets the row.
/// 3. A loser of a concurrent race re-reads the winner's id.
pub async fn ingest_envelope(
    pool: &PgPool,
    env: &IngressEnvelope,
    window_days: u32,
) -> Result<IngestAccepted> {
    let key = dedupe_key(env);

    if let Some(prior) = lookup_recent_by_dedupe_key(pool, &key, window_days).await? {
        return Ok(IngestAccepted::new(prior, true));
    }

    let envelope_json = serde_json::to_value(env).context("serialize envelope")?;
    let attachments_json = if env.payload.attachments.is_empty() {
        None
    } else {
        Some(serde_json::to_value(&env.payload.attachments).context("serialize attachments")?)
    };

    let inserted: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into message_inbox (
            schema_version, envelope,
            source_channel, source_endpoint_identity, source_sender_identity,
            source_thread_identity, policy_tier, dedupe_key,
            attachments, normalized_text
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        on conflict (dedupe_key, received_at) where dedupe_key is not null do nothing
        returning id
        "#,
    )
    .bind(&env.schema_version)
    .bind(&envelope_json)
    .bind(&env.source.channel)
    .bind(&env.source.endpoint_identity)
    .bind(&env.sender.identity)
    .bind(&env.event.external_thread_id)
    .bind(env.control.policy_tier.as_str())
    .bind(&key)
    .bind(&attachments_json)
    .bind(&env.payload.normalized_text)
    .fetch_optional(pool)
    .await
    .context("ingest insert failed")?;

    if let Some((id,)) = inserted {
        return Ok(IngestAccepted::new(id, false));
    }

    // Concurrent insert won the race; surface its request id.
    let prior = lookup_recent_by_dedupe_key(pool, &key, window_days)
        .await?
        .ok_or_else(|| anyhow!("dedupe conflict but no prior row for key {key}"))?;
    Ok(IngestAccepted::new(prior, true))
}

async fn lookup_recent_by_dedupe_key(
    pool: &PgPool,
    key: &str,
    window_days: u32,
) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        select id
        from message_inbox
        where dedupe_key = $1
          and received_at >= now() - make_interval(days => $2)
        order by received_at asc
        limit 1
        "#,
    )
    .bind(key)
    .bind(window_days as i32)
    .fetch_optional(pool)
    .await
    .context("dedupe window lookup failed")?;
    Ok(row.map(|(id,)| id))
}

/// Conditionally advance a request's lifecycle.
///
/// Returns `true` when the row moved, `false` when another worker got there
/// first (the `WHERE lifecycle_state = $from` guard matched nothing). Illegal
/// transitions are rejected before touching the database.
pub async fn transition_lifecycle(
    pool: &PgPool,
    request_id: Uuid,
    from: LifecycleState,
    to: LifecycleState,
) -> Result<bool> {
    from.transition_to(to)
        .map_err(|e| anyhow!("{e} (request {request_id})"))?;

    let res = sqlx::query(
        r#"
        update message_inbox
           set lifecycle_state = $1,
               completed_at = case
                   when $1 in ('completed', 'dead_lettered') then now()
                   else completed_at
               end
         where id = $2
           and lifecycle_state = $3
        "#,
    )
    .bind(to.as_str())
    .bind(request_id)
    .bind(from.as_str())
    .execute(pool)
    .await
    .context("lifecycle transition update failed")?;

    Ok(res.rows_affected() > 0)
}

/// Store the triage decision made for a request.
pub async fn record_triage_outcome(pool: &PgPool, request_id: Uuid, outcome: &Value) -> Result<()> {
    sqlx::query(
        r#"
        update message_inbox
           set triage_outcome = $1
         where id = $2
        "#,
    )
    .bind(outcome)
    .bind(request_id)
    .execute(pool)
    .await
    .context("record_triage_outcome failed")?;
    Ok(())
}

/// Store the classifier's (or fallback's) route decision.
pub async fn record_classification(
    pool: &PgPool,
    request_id: Uuid,
    classification: &Value,
) -> Result<()> {
    sqlx::query(
        r#"
        update message_inbox
           set classification = $1
         where id = $2
        "#,
    )
    .bind(classification)
    .bind(request_id)
    .execute(pool)
    .await
    .context("record_classification failed")?;
    Ok(())
}

/// Append one per-target outcome to `dispatch_outcomes`.
pub async fn append_dispatch_outcome(
    pool: &PgPool,
    request_id: Uuid,
    outcome: &DispatchOutcome,
) -> Result<()> {
    let outcome_json = serde_json::to_value(outcome).context("serialize dispatch outcome")?;
    sqlx::query(
        r#"
        update message_inbox
           set dispatch_outcomes = dispatch_outcomes || $1::jsonb
         where id = $2
        "#,
    )
    .bind(&outcome_json)
    .bind(request_id)
    .execute(pool)
    .await
    .context("append_dispatch_outcome failed")?;
    Ok(())
}

/// Insert a replayed request from a DLQ row.
///
/// The new row carries no dedupe key (a replay must not collide with the
/// original's key) and records its lineage in `processing_metadata`.
pub async fn insert_replay(
    pool: &PgPool,
    env: &IngressEnvelope,
    original_request_id: Uuid,
    dlq_id: Uuid,
) -> Result<Uuid> {
    let envelope_json = serde_json::to_value(env).context("serialize envelope")?;
    let metadata = serde_json::json!({
        "replay_of_dlq_id": dlq_id,
        "original_request_id": original_request_id,
    });

    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into message_inbox (
            schema_version, envelope,
            source_channel, source_endpoint_identity, source_sender_identity,
            source_thread_identity, policy_tier,
            normalized_text, processing_metadata
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        returning id
        "#,
    )
    .bind(&env.schema_version)
    .bind(&envelope_json)
    .bind(&env.source.channel)
    .bind(&env.source.endpoint_identity)
    .bind(&env.sender.identity)
    .bind(&env.event.external_thread_id)
    .bind(env.control.policy_tier.as_str())
    .bind(&env.payload.normalized_text)
    .bind(&metadata)
    .fetch_one(pool)
    .await
    .context("insert_replay failed")?;

    Ok(id)
}

/// Log an outbound `notify.v1` delivery into the same inbox table
/// (`direction='outbound'`), preserving two-way conversation history.
pub async fn log_outbound_notification(
    pool: &PgPool,
    notify: &NotifyRequestV1,
    success: bool,
) -> Result<Uuid> {
    let envelope_json = serde_json::to_value(notify).context("serialize notify request")?;
    let state = if success {
        LifecycleState::Completed
    } else {
        LifecycleState::Failed
    };

    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        insert into message_inbox (
            schema_version, direction, envelope,
            source_channel, source_endpoint_identity, source_sender_identity,
            policy_tier, lifecycle_state, normalized_text, completed_at
        ) values ($1, 'outbound', $2, $3, $4, $5, 'default', $6, $7, now())
        returning id
        "#,
    )
    .bind(&notify.schema_version)
    .bind(&envelope_json)
    .bind(&notify.channel)
    .bind(&notify.source_butler)
    .bind(&notify.recipient)
    .bind(state.as_str())
    .bind(&notify.message)
    .fetch_one(pool)
    .await
    .context("log_outbound_notification failed")?;

    Ok(id)
}

/// Operator override: mark a non-terminal request completed regardless of
/// its current state. Terminal states are never overwritten.
pub async fn force_complete(pool: &PgPool, request_id: Uuid) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update message_inbox
           set lifecycle_state = 'completed',
               completed_at = now()
         where id = $1
           and lifecycle_state not in ('completed', 'dead_lettered')
        "#,
    )
    .bind(request_id)
    .execute(pool)
    .await
    .context("force_complete failed")?;

    Ok(res.rows_affected() > 0)
}

#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub id: Uuid,
    pub received_at: DateTime<Utc>,
    pub schema_version: String,
    pub direction: String,
    pub envelope: Value,
    pub source_channel: String,
    pub source_endpoint_identity: String,
    pub source_sender_identity: String,
    pub source_thread_identity: Option<String>,
    pub policy_tier: String,
    pub dedupe_key: Option<String>,
    pub lifecycle_state: LifecycleState,
    pub triage_outcome: Option<Value>,
    pub classification: Option<Value>,
    pub dispatch_outcomes: Value,
    pub processing_metadata: Value,
    pub completed_at: Option<DateTime<Utc>>,
}

pub async fn fetch_inbox_record(pool: &PgPool, request_id: Uuid) -> Result<InboxRecord> {
    let row = sqlx::query(
        r#"
        select id, received_at, schema_version, direction, envelope,
               source_channel, source_endpoint_identity, source_sender_identity,
               source_thread_identity, policy_tier, dedupe_key,
               lifecycle_state, triage_outcome, classification,
               dispatch_outcomes, processing_metadata, completed_at
        from message_inbox
        where id = $1
        "#,
    )
    .bind(request_id)
    .fetch_one(pool)
    .await
    .context("fetch_inbox_record failed")?;

    let state_str: String = row.try_get("lifecycle_state")?;
    let lifecycle_state = LifecycleState::parse(&state_str)
        .ok_or_else(|| anyhow!("invalid lifecycle_state in row: {state_str}"))?;

    Ok(InboxRecord {
        id: row.try_get("id")?,
        received_at: row.try_get("received_at")?,
        schema_version: row.try_get("schema_version")?,
        direction: row.try_get("direction")?,
        envelope: row.try_get("envelope")?,
        source_channel: row.try_get("source_channel")?,
        source_endpoint_identity: row.try_get("source_endpoint_identity")?,
        source_sender_identity: row.try_get("source_sender_identity")?,
        source_thread_identity: row.try_get("source_thread_identity")?,
        policy_tier: row.try_get("policy_tier")?,
        dedupe_key: row.try_get("dedupe_key")?,
        lifecycle_state,
        triage_outcome: row.try_get("triage_outcome")?,
        classification: row.try_get("classification")?,
        dispatch_outcomes: row.try_get("dispatch_outcomes")?,
        processing_metadata: row.try_get("processing_metadata")?,
        completed_at: row.try_get("completed_at")?,
    })
}
