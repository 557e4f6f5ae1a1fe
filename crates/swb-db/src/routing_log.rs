//! Per-subroute routing log rows.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewRoutingLog {
    pub request_id: Option<Uuid>,
    pub source_butler: String,
    pub target_butler: String,
    /// Logical operation, e.g. "route.v1" or "notify.v1".
    pub tool_name: String,
    pub success: bool,
    pub duration_ms: Option<i32>,
    pub error: Option<String>,
    pub source_endpoint_identity: Option<String>,
    pub source_sender_identity: Option<String>,
    pub source_thread_identity: Option<String>,
}

pub async fn insert_routing_log(pool: &PgPool, entry: &NewRoutingLog) -> Result<()> {
    sqlx::query(
        r#"
        insert into routing_log (
            request_id, source_butler, target_butler, tool_name,
            success, duration_ms, error,
            source_endpoint_identity, source_sender_identity, source_thread_identity
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(entry.request_id)
    .bind(&entry.source_butler)
    .bind(&entry.target_butler)
    .bind(&entry.tool_name)
    .bind(entry.success)
    .bind(entry.duration_ms)
    .bind(&entry.error)
    .bind(&entry.source_endpoint_identity)
    .bind(&entry.source_sender_identity)
    .bind(&entry.source_thread_identity)
    .execute(pool)
    .await
    .context("insert_routing_log failed")?;
    Ok(())
}
