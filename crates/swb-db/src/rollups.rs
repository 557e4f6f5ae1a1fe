//! Connector statistics rollups. Counters are upserted in place; the
//! primary keys make every increment idempotent to re-run per bucket.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Record the outcome of one ingest batch for a connector.
pub async fn record_ingest_stats(
    pool: &PgPool,
    connector_type: &str,
    endpoint_identity: &str,
    ingested: i64,
    failed: i64,
    deduped: i64,
    api_calls: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into connector_stats_hourly (
            connector_type, endpoint_identity, hour,
            messages_ingested, messages_failed, dedupe_accepted, source_api_calls
        ) values ($1, $2, date_trunc('hour', now()), $3, $4, $5, $6)
        on conflict (connector_type, endpoint_identity, hour) do update set
            messages_ingested = connector_stats_hourly.messages_ingested + excluded.messages_ingested,
            messages_failed   = connector_stats_hourly.messages_failed   + excluded.messages_failed,
            dedupe_accepted   = connector_stats_hourly.dedupe_accepted   + excluded.dedupe_accepted,
            source_api_calls  = connector_stats_hourly.source_api_calls  + excluded.source_api_calls
        "#,
    )
    .bind(connector_type)
    .bind(endpoint_identity)
    .bind(ingested)
    .bind(failed)
    .bind(deduped)
    .bind(api_calls)
    .execute(pool)
    .await
    .context("record_ingest_stats failed")?;

    sqlx::query(
        r#"
        insert into connector_stats_daily (
            connector_type, endpoint_identity, day, messages_ingested, messages_failed
        ) values ($1, $2, current_date, $3, $4)
        on conflict (connector_type, endpoint_identity, day) do update set
            messages_ingested = connector_stats_daily.messages_ingested + excluded.messages_ingested,
            messages_failed   = connector_stats_daily.messages_failed   + excluded.messages_failed
        "#,
    )
    .bind(connector_type)
    .bind(endpoint_identity)
    .bind(ingested)
    .bind(failed)
    .execute(pool)
    .await
    .context("record_ingest_stats daily failed")?;

    Ok(())
}

/// Record a connector heartbeat with its health verdict.
pub async fn record_connector_heartbeat(
    pool: &PgPool,
    connector_type: &str,
    endpoint_identity: &str,
    health: &str,
) -> Result<()> {
    let (healthy, degraded, error) = match health {
        "healthy" => (1, 0, 0),
        "degraded" => (0, 1, 0),
        _ => (0, 0, 1),
    };

    sqlx::query(
        r#"
        insert into connector_stats_hourly (
            connector_type, endpoint_identity, hour,
            heartbeat_count, healthy_count, degraded_count, error_count
        ) values ($1, $2, date_trunc('hour', now()), 1, $3, $4, $5)
        on conflict (connector_type, endpoint_identity, hour) do update set
            heartbeat_count = connector_stats_hourly.heartbeat_count + 1,
            healthy_count   = connector_stats_hourly.healthy_count   + excluded.healthy_count,
            degraded_count  = connector_stats_hourly.degraded_count  + excluded.degraded_count,
            error_count     = connector_stats_hourly.error_count     + excluded.error_count
        "#,
    )
    .bind(connector_type)
    .bind(endpoint_identity)
    .bind(healthy)
    .bind(degraded)
    .bind(error)
    .execute(pool)
    .await
    .context("record_connector_heartbeat failed")?;

    Ok(())
}

/// Count one dispatch toward the per-target daily fanout rollup.
pub async fn record_fanout_dispatch(
    pool: &PgPool,
    connector_type: &str,
    target_butler: &str,
    success: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into connector_fanout_daily (
            connector_type, target_butler, day, dispatch_count, success_count
        ) values ($1, $2, current_date, 1, $3)
        on conflict (connector_type, target_butler, day) do update set
            dispatch_count = connector_fanout_daily.dispatch_count + 1,
            success_count  = connector_fanout_daily.success_count + excluded.success_count
        "#,
    )
    .bind(connector_type)
    .bind(target_butler)
    .bind(if success { 1i64 } else { 0i64 })
    .execute(pool)
    .await
    .context("record_fanout_dispatch failed")?;

    Ok(())
}
