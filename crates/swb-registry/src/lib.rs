//! Butler registry: roster discovery and the in-process lookup cache.
//!
//! Discovery scans a roster directory for `<name>/butler.yaml` descriptors
//! and upserts each into `butler_registry`. Routing reads from an in-process
//! snapshot, refreshed periodically and after heartbeats; a target absent
//! from the snapshot is a routing error, never an implicit registration.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{info, warn};

use swb_db::{ButlerRow, NewButler};

/// On-disk butler descriptor (`roster/<name>/butler.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButlerDescriptor {
    pub name: String,
    pub endpoint_url: String,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub capabilities: HashMap<String, bool>,
}

fn default_transport() -> String {
    "http".to_string()
}

pub fn load_descriptor(path: &Path) -> Result<ButlerDescriptor> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read butler descriptor {path:?}"))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parse butler descriptor {path:?}"))
}

/// Scan the roster directory and register every descriptor found.
///
/// A directory without `butler.yaml` is skipped silently; a descriptor that
/// fails to parse is logged and skipped; one broken butler must not block
/// the rest of the roster.
pub async fn discover_roster(pool: &PgPool, roster_dir: &Path) -> Result<Vec<ButlerDescriptor>> {
    let mut discovered = Vec::new();
    if !roster_dir.is_dir() {
        return Ok(discovered);
    }

    let mut entries: Vec<_> = std::fs::read_dir(roster_dir)
        .with_context(|| format!("read roster dir {roster_dir:?}"))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    for dir in entries {
        let descriptor_path = dir.join("butler.yaml");
        if !descriptor_path.exists() {
            continue;
        }
        let descriptor = match load_descriptor(&descriptor_path) {
            Ok(d) => d,
            Err(e) => {
                warn!(path = ?descriptor_path, error = %e, "skipping undecodable butler descriptor");
                continue;
            }
        };

        register_descriptor(pool, &descriptor).await?;
        info!(name = %descriptor.name, endpoint = %descriptor.endpoint_url, "butler registered");
        discovered.push(descriptor);
    }

    Ok(discovered)
}

pub async fn register_descriptor(pool: &PgPool, descriptor: &ButlerDescriptor) -> Result<()> {
    let capabilities: Value =
        serde_json::to_value(&descriptor.capabilities).context("serialize capabilities")?;
    swb_db::upsert_butler(
        pool,
        &NewButler {
            name: descriptor.name.clone(),
            endpoint_url: descriptor.endpoint_url.clone(),
            transport: descriptor.transport.clone(),
            description: descriptor.description.clone(),
            modules: descriptor.modules.clone(),
            capabilities,
        },
    )
    .await
}

/// Copy-on-write registry snapshot. Readers clone an `Arc` and keep a
/// consistent view for the whole routing decision.
pub struct RegistryCache {
    inner: RwLock<Arc<HashMap<String, ButlerRow>>>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    pub async fn refresh(&self, pool: &PgPool) -> Result<()> {
        let rows = swb_db::list_butlers(pool).await?;
        let map: HashMap<String, ButlerRow> =
            rows.into_iter().map(|r| (r.name.clone(), r)).collect();
        *self.inner.write().await = Arc::new(map);
        Ok(())
    }

    pub async fn snapshot(&self) -> Arc<HashMap<String, ButlerRow>> {
        self.inner.read().await.clone()
    }

    pub async fn lookup(&self, name: &str) -> Option<ButlerRow> {
        self.inner.read().await.get(name).cloned()
    }

    /// Install a snapshot directly (tests and bootstrap).
    pub async fn install(&self, rows: Vec<ButlerRow>) {
        let map: HashMap<String, ButlerRow> =
            rows.into_iter().map(|r| (r.name.clone(), r)).collect();
        *self.inner.write().await = Arc::new(map);
    }
}

impl Default for RegistryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability gate: flags default to off when absent.
pub fn has_capability(row: &ButlerRow, capability: &str) -> bool {
    row.capabilities
        .get(capability)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn descriptor_parses_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("butler.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "name: health\nendpoint_url: http://localhost:8101/route\nmodules: [diet, medications]\ncapabilities:\n  backfill: true\n"
        )
        .unwrap();

        let d = load_descriptor(&path).unwrap();
        assert_eq!(d.name, "health");
        assert_eq!(d.transport, "http");
        assert_eq!(d.modules, vec!["diet", "medications"]);
        assert_eq!(d.capabilities.get("backfill"), Some(&true));
    }

    #[test]
    fn capability_flags_default_to_off() {
        let row = ButlerRow {
            name: "general".to_string(),
            endpoint_url: "http://localhost:8100/route".to_string(),
            transport: "http".to_string(),
            description: None,
            modules: serde_json::json!([]),
            capabilities: serde_json::json!({"backfill": true}),
            last_seen_at: None,
            registered_at: chrono::Utc::now(),
        };
        assert!(has_capability(&row, "backfill"));
        assert!(!has_capability(&row, "streaming"));
    }

    #[tokio::test]
    async fn cache_lookup_uses_installed_snapshot() {
        let cache = RegistryCache::new();
        assert!(cache.lookup("general").await.is_none());

        cache
            .install(vec![ButlerRow {
                name: "general".to_string(),
                endpoint_url: "http://localhost:8100/route".to_string(),
                transport: "http".to_string(),
                description: None,
                modules: serde_json::json!([]),
                capabilities: serde_json::json!({}),
                last_seen_at: None,
                registered_at: chrono::Utc::now(),
            }])
            .await;

        assert!(cache.lookup("general").await.is_some());
        assert!(cache.lookup("unknown").await.is_none());
    }
}
