//! Partition manager for `message_inbox`.
//!
//! The maintenance task runs this periodically: the current and next month
//! partitions must always exist before traffic reaches them, and partitions
//! past retention are dropped whole (cheap compared to row deletes).

use anyhow::{ensure, Context, Result};
use sqlx::PgPool;

/// Ensure current + next month partitions exist. Returns the partition names.
pub async fn ensure_partitions(pool: &PgPool) -> Result<Vec<String>> {
    let mut created = Vec::with_capacity(2);
    for offset_months in [0i32, 1] {
        let (name,): (String,) = sqlx::query_as(
            "select switchboard_inbox_ensure_partition(now() + make_interval(months => $1))",
        )
        .bind(offset_months)
        .fetch_one(pool)
        .await
        .context("ensure partition failed")?;
        created.push(name);
    }
    Ok(created)
}

/// Drop partitions whose upper bound is older than the retention horizon.
/// Returns the number of partitions dropped. Retention is clamped to a
/// minimum of 3 months; dropping fresher data is refused.
pub async fn drop_expired_partitions(pool: &PgPool, retention_months: u32) -> Result<u32> {
    ensure!(
        retention_months >= 3,
        "retention must be >= 3 months, got {retention_months}"
    );

    let (dropped,): (i32,) =
        sqlx::query_as("select switchboard_inbox_drop_expired_partitions($1)")
            .bind(retention_months as i32)
            .fetch_one(pool)
            .await
            .context("drop expired partitions failed")?;

    Ok(dropped.max(0) as u32)
}
