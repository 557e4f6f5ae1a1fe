//! Thread affinity: sticky `(channel, thread) -> butler` pins with TTL.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Record (or refresh) the pin after a successful dispatch.
pub async fn upsert_thread_affinity(
    pool: &PgPool,
    channel: &str,
    external_thread_id: &str,
    target_butler: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into thread_affinity (source_channel, external_thread_id, last_target_butler, updated_at)
        values ($1, $2, $3, now())
        on conflict (source_channel, external_thread_id) do update set
            last_target_butler = excluded.last_target_butler,
            updated_at = now()
        "#,
    )
    .bind(channel)
    .bind(external_thread_id)
    .bind(target_butler)
    .execute(pool)
    .await
    .context("upsert_thread_affinity failed")?;
    Ok(())
}

/// Look up a live pin. Entries older than `ttl_seconds` are treated as
/// absent (and left for a sweeper; expiry is read-side).
pub async fn lookup_thread_affinity(
    pool: &PgPool,
    channel: &str,
    external_thread_id: &str,
    ttl_seconds: i64,
) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        select last_target_butler
        from thread_affinity
        where source_channel = $1
          and external_thread_id = $2
          and updated_at >= now() - make_interval(secs => $3)
        "#,
    )
    .bind(channel)
    .bind(external_thread_id)
    .bind(ttl_seconds as f64)
    .fetch_optional(pool)
    .await
    .context("lookup_thread_affinity failed")?;

    Ok(row.map(|(b,)| b))
}
