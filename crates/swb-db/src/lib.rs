//! PostgreSQL persistence for the switchboard core.
//!
//! One pool, embedded migrations, and narrow accessors per table. The inbox
//! is append-only on its immutable core; lifecycle mutations go through
//! conditional UPDATEs so concurrent workers can never regress a state.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod affinity;
pub mod audit;
pub mod cursors;
pub mod dlq;
pub mod inbox;
pub mod partitions;
pub mod registry;
pub mod rollups;
pub mod routing_log;
pub mod rules;

pub use affinity::{lookup_thread_affinity, upsert_thread_affinity};
pub use audit::{insert_operator_audit, AuditOutcome, NewOperatorAudit, OperatorAction};
pub use cursors::{load_cursor, save_cursor};
pub use dlq::{
    fetch_dead_letter, insert_dead_letter, list_replayable, mark_replayed, DeadLetterRow,
    NewDeadLetter, ReplayError,
};
pub use inbox::{
    append_dispatch_outcome, dedupe_key, fetch_inbox_record, force_complete, ingest_envelope,
    insert_replay, log_outbound_notification, record_classification, record_triage_outcome,
    transition_lifecycle, InboxRecord,
};
pub use partitions::{drop_expired_partitions, ensure_partitions};
pub use registry::{
    list_butlers, lookup_butler, touch_heartbeat, upsert_butler, ButlerRow, NewButler,
};
pub use rollups::{record_connector_heartbeat, record_fanout_dispatch, record_ingest_stats};
pub use routing_log::{insert_routing_log, NewRoutingLog};
pub use rules::{
    load_active_instructions, load_enabled_rules, rules_fingerprint, RuleFingerprint,
    TriageRuleRow,
};

pub const ENV_DB_URL: &str = "SWB_DATABASE_URL";

/// Connect to Postgres using SWB_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using SWB_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='message_inbox'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_inbox_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_inbox_table: bool,
}

/// Detect a Postgres unique constraint violation by name.
pub fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || (db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint))
        }
        _ => false,
    }
}
