//! Layered YAML configuration for the switchboard.
//!
//! Config files merge in order (base -> env -> instance overrides) via
//! deep-merge, canonicalize to stable JSON, and hash with SHA-256 so every
//! running instance can report exactly which configuration it carries.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

mod settings;

pub use settings::{
    BufferSettings, CircuitSettings, ClassifierSettings, DedupeSettings, DispatchSettings,
    RateLimitSettings, RegistrySettings, RetentionSettings, SwitchboardConfig, TelemetrySettings,
    TierRate, TimeoutSettings, TriageSettings,
};

pub const ENV_DB_URL: &str = "SWB_DATABASE_URL";

/// Load + merge YAML files in order, then canonicalize to JSON and hash.
/// Later files override earlier files via deep-merge.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

/// Load layered YAML and deserialize the merged document into the typed
/// [`SwitchboardConfig`]. Missing sections take their defaults.
pub fn load_switchboard_config(paths: &[&str]) -> Result<(SwitchboardConfig, LoadedConfig)> {
    let loaded = load_layered_yaml(paths)?;
    let cfg: SwitchboardConfig = serde_json::from_value(loaded.config_json.clone())
        .context("config does not match switchboard schema")?;
    Ok((cfg, loaded))
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn later_layers_override_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(&dir, "base.yaml", "buffer:\n  max_depth: 100\n  hard_limit: 500\n");
        let over = write_yaml(&dir, "over.yaml", "buffer:\n  max_depth: 250\n");

        let loaded = load_layered_yaml(&[&base, &over]).unwrap();
        assert_eq!(loaded.config_json["buffer"]["max_depth"], 250);
        assert_eq!(loaded.config_json["buffer"]["hard_limit"], 500);
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_yaml(&dir, "a.yaml", "x: 1\ny: 2\n");
        let b = write_yaml(&dir, "b.yaml", "y: 2\nx: 1\n");

        let ha = load_layered_yaml(&[&a]).unwrap().config_hash;
        let hb = load_layered_yaml(&[&b]).unwrap().config_hash;
        assert_eq!(ha, hb);
    }

    #[test]
    fn typed_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(
            &dir,
            "base.yaml",
            "classifier:\n  endpoint_url: http://localhost:9090/classify\n",
        );
        let (cfg, _) = load_switchboard_config(&[&base]).unwrap();
        assert_eq!(cfg.retention.months, 3);
        assert_eq!(cfg.buffer.max_depth, 10_000);
        assert_eq!(cfg.circuit.failure_threshold, 5);
        assert_eq!(cfg.timeouts.for_channel("telegram").as_secs(), 15);
        assert_eq!(cfg.timeouts.for_channel("unknown-ch").as_secs(), 30);
    }
}
