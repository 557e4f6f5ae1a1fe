//! Butler registry storage: upsert-by-name, heartbeat, lookup.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct NewButler {
    pub name: String,
    pub endpoint_url: String,
    /// "http" or "sse".
    pub transport: String,
    pub description: Option<String>,
    pub modules: Vec<String>,
    pub capabilities: Value,
}

#[derive(Debug, Clone)]
pub struct ButlerRow {
    pub name: String,
    pub endpoint_url: String,
    pub transport: String,
    pub description: Option<String>,
    pub modules: Value,
    pub capabilities: Value,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// Register or update a butler in the registry.
pub async fn upsert_butler(pool: &PgPool, butler: &NewButler) -> Result<()> {
    let modules_json = serde_json::to_value(&butler.modules).context("serialize modules")?;
    sqlx::query(
        r#"
        insert into butler_registry
            (name, endpoint_url, transport, description, modules, capabilities, last_seen_at)
        values ($1, $2, $3, $4, $5, $6, now())
        on conflict (name) do update set
            endpoint_url = excluded.endpoint_url,
            transport    = excluded.transport,
            description  = excluded.description,
            modules      = excluded.modules,
            capabilities = excluded.capabilities,
            last_seen_at = now()
        "#,
    )
    .bind(&butler.name)
    .bind(&butler.endpoint_url)
    .bind(&butler.transport)
    .bind(&butler.description)
    .bind(&modules_json)
    .bind(&butler.capabilities)
    .execute(pool)
    .await
    .context("upsert_butler failed")?;
    Ok(())
}

/// Refresh `last_seen_at` after a successful dispatch.
pub async fn touch_heartbeat(pool: &PgPool, name: &str) -> Result<()> {
    sqlx::query(
        r#"
        update butler_registry
           set last_seen_at = now()
         where name = $1
        "#,
    )
    .bind(name)
    .execute(pool)
    .await
    .context("touch_heartbeat failed")?;
    Ok(())
}

pub async fn lookup_butler(pool: &PgPool, name: &str) -> Result<Option<ButlerRow>> {
    let row = sqlx::query(
        r#"
        select name, endpoint_url, transport, description, modules,
               capabilities, last_seen_at, registered_at
        from butler_registry
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("lookup_butler failed")?;

    row.map(map_row).transpose()
}

pub async fn list_butlers(pool: &PgPool) -> Result<Vec<ButlerRow>> {
    let rows = sqlx::query(
        r#"
        select name, endpoint_url, transport, description, modules,
               capabilities, last_seen_at, registered_at
        from butler_registry
        order by name
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_butlers failed")?;

    rows.into_iter().map(map_row).collect()
}

fn map_row(row: sqlx::postgres::PgRow) -> Result<ButlerRow> {
    Ok(ButlerRow {
        name: row.try_get("name")?,
        endpoint_url: row.try_get("endpoint_url")?,
        transport: row.try_get("transport")?,
        description: row.try_get("description")?,
        modules: row.try_get("modules")?,
        capabilities: row.try_get("capabilities")?,
        last_seen_at: row.try_get("last_seen_at")?,
        registered_at: row.try_get("registered_at")?,
    })
}
