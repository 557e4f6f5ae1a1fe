//! Triage rule rows and routing instructions.
//!
//! Rules are cached in-process; `rules_fingerprint` is the cheap change
//! detector the cache polls before reloading.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TriageRuleRow {
    pub id: Uuid,
    pub priority: i32,
    pub conditions: Value,
    pub action: Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Enabled rules in evaluation order: priority ASC, created_at ASC.
pub async fn load_enabled_rules(pool: &PgPool) -> Result<Vec<TriageRuleRow>> {
    let rows = sqlx::query(
        r#"
        select id, priority, conditions, action, enabled, created_at, updated_at
        from triage_rules
        where enabled = true
        order by priority asc, created_at asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("load_enabled_rules failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(TriageRuleRow {
            id: row.try_get("id")?,
            priority: row.try_get("priority")?,
            conditions: row.try_get("conditions")?,
            action: row.try_get("action")?,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        });
    }
    Ok(out)
}

/// Change detector for the in-process rule cache: row count plus the newest
/// `updated_at`. Any insert, toggle, or edit moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleFingerprint {
    pub count: i64,
    pub latest_update_micros: i64,
}

pub async fn rules_fingerprint(pool: &PgPool) -> Result<RuleFingerprint> {
    let (count, latest): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
        r#"
        select count(*)::bigint, max(updated_at)
        from triage_rules
        "#,
    )
    .fetch_one(pool)
    .await
    .context("rules_fingerprint failed")?;

    Ok(RuleFingerprint {
        count,
        latest_update_micros: latest.map(|t| t.timestamp_micros()).unwrap_or(0),
    })
}

/// Active routing instructions in stable injection order (priority ASC,
/// created_at ASC) for classifier context.
pub async fn load_active_instructions(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        select instruction
        from routing_instructions
        where enabled = true
          and deleted_at is null
        order by priority asc, created_at asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("load_active_instructions failed")?;

    Ok(rows.into_iter().map(|(i,)| i).collect())
}
