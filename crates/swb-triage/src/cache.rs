//! In-process triage rule cache with versioned refresh.
//!
//! The refresh loop polls `rules_fingerprint` (count + newest updated_at);
//! rules are only reloaded when the fingerprint moves, so steady-state
//! evaluation never touches the database.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info, warn};

use swb_db::RuleFingerprint;

use crate::rule::TriageRule;

pub struct RuleCache {
    inner: RwLock<CacheState>,
}

struct CacheState {
    rules: Arc<Vec<TriageRule>>,
    fingerprint: Option<RuleFingerprint>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheState {
                rules: Arc::new(Vec::new()),
                fingerprint: None,
            }),
        }
    }

    /// Current snapshot; cheap to clone, stable for the whole evaluation.
    pub async fn snapshot(&self) -> Arc<Vec<TriageRule>> {
        self.inner.read().await.rules.clone()
    }

    /// Reload rules iff the DB fingerprint changed. Returns `true` when a
    /// reload happened. Rows that fail to parse are skipped with a warning;
    /// one bad rule must not take triage down.
    pub async fn refresh_if_changed(&self, pool: &PgPool) -> Result<bool> {
        let fingerprint = swb_db::rules_fingerprint(pool).await?;

        {
            let state = self.inner.read().await;
            if state.fingerprint == Some(fingerprint) {
                return Ok(false);
            }
        }

        let rows = swb_db::load_enabled_rules(pool).await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            match TriageRule::from_row(row) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(rule_id = %e.rule_id, error = %e, "skipping unparseable triage rule"),
            }
        }

        info!(count = rules.len(), "triage rules reloaded");

        let mut state = self.inner.write().await;
        state.rules = Arc::new(rules);
        state.fingerprint = Some(fingerprint);
        Ok(true)
    }

    /// Replace the rule set directly. Test and bootstrap hook; production
    /// refresh goes through [`refresh_if_changed`].
    ///
    /// [`refresh_if_changed`]: RuleCache::refresh_if_changed
    pub async fn install(&self, rules: Vec<TriageRule>) {
        let mut state = self.inner.write().await;
        state.rules = Arc::new(rules);
        state.fingerprint = None;
    }
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new()
    }
}
