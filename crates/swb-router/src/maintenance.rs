//! Background maintenance loops: partition management, rule cache refresh,
//! registry refresh. Each loop is an independent task; a failing iteration
//! logs and waits for the next tick; maintenance never crashes the core.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{error, info};

use swb_registry::RegistryCache;
use swb_triage::RuleCache;

/// Hourly: ensure current + next month partitions, drop expired ones.
pub async fn run_partition_manager(pool: PgPool, retention_months: u32) {
    let mut tick = tokio::time::interval(Duration::from_secs(3600));
    loop {
        tick.tick().await;

        match swb_db::ensure_partitions(&pool).await {
            Ok(names) => info!(?names, "inbox partitions ensured"),
            Err(e) => error!(error = ?e, "partition ensure failed"),
        }

        match swb_db::drop_expired_partitions(&pool, retention_months).await {
            Ok(0) => {}
            Ok(n) => info!(dropped = n, "expired inbox partitions dropped"),
            Err(e) => error!(error = ?e, "partition prune failed"),
        }
    }
}

/// Poll the triage rule fingerprint and reload on change.
pub async fn run_rule_refresher(pool: PgPool, rules: Arc<RuleCache>, refresh_seconds: u64) {
    let mut tick = tokio::time::interval(Duration::from_secs(refresh_seconds.max(1)));
    loop {
        tick.tick().await;
        if let Err(e) = rules.refresh_if_changed(&pool).await {
            error!(error = ?e, "triage rule refresh failed");
        }
    }
}

/// Periodically refresh the registry snapshot.
pub async fn run_registry_refresher(
    pool: PgPool,
    registry: Arc<RegistryCache>,
    refresh_seconds: u64,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(refresh_seconds.max(1)));
    loop {
        tick.tick().await;
        if let Err(e) = registry.refresh(&pool).await {
            error!(error = ?e, "registry refresh failed");
        }
    }
}
