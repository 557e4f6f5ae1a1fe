//! Connector source cursor persistence.

use anyhow::{Context, Result};
use sqlx::PgPool;

pub async fn load_cursor(
    pool: &PgPool,
    connector_type: &str,
    endpoint_identity: &str,
) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> = sqlx::query_as(
        r#"
        select position
        from connector_cursors
        where connector_type = $1 and endpoint_identity = $2
        "#,
    )
    .bind(connector_type)
    .bind(endpoint_identity)
    .fetch_optional(pool)
    .await
    .context("load_cursor failed")?;

    Ok(row.and_then(|(p,)| p))
}

pub async fn save_cursor(
    pool: &PgPool,
    connector_type: &str,
    endpoint_identity: &str,
    position: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into connector_cursors (connector_type, endpoint_identity, position, updated_at)
        values ($1, $2, $3, now())
        on conflict (connector_type, endpoint_identity) do update set
            position = excluded.position,
            updated_at = now()
        "#,
    )
    .bind(connector_type)
    .bind(endpoint_identity)
    .bind(position)
    .execute(pool)
    .await
    .context("save_cursor failed")?;
    Ok(())
}
