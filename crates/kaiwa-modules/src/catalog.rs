//! Module catalog: which providers exist and how they are configured.
//!
//! Loaded from `services.json`. Each entry names a `(kind, code)` pair, an
//! optional `is_default` flag per kind, and a config object that is merged
//! over the factory's defaults (entry keys win).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use kaiwa_core::{Error, Result};

use crate::module::ModuleKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    #[default]
    Inprocess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub kind: ModuleKind,
    pub code: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub mode: DeployMode,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleCatalog {
    pub services: Vec<ServiceEntry>,
}

impl ModuleCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let mut catalog: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        for entry in &mut catalog.services {
            expand_env(&mut entry.config);
        }
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        for kind in ModuleKind::ALL {
            let defaults = self
                .services
                .iter()
                .filter(|s| s.kind == kind && s.is_default)
                .count();
            if defaults > 1 {
                return Err(Error::Config(format!(
                    "multiple default modules for kind {kind}"
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for entry in &self.services {
            if !seen.insert((entry.kind, entry.code.clone())) {
                return Err(Error::Config(format!(
                    "duplicate catalog entry {}/{}",
                    entry.kind, entry.code
                )));
            }
        }
        Ok(())
    }
}

/// Replace `${VAR}` string values with the environment variable's content so
/// credentials stay out of the catalog file. Unset variables become empty
/// strings, surfacing as an init failure for that module rather than a
/// process-level one.
fn expand_env(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
                *s = std::env::var(name).unwrap_or_default();
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                expand_env(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                expand_env(item);
            }
        }
        _ => {}
    }
}

/// Shallow merge: `overlay` keys replace `base` keys; nested objects merge
/// one level deep, matching how per-module default configs are overridden.
pub fn merge_config(base: Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match (base_map.get_mut(key), value) {
                    (Some(Value::Object(existing)), Value::Object(incoming)) => {
                        for (k, v) in incoming {
                            existing.insert(k.clone(), v.clone());
                        }
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(base_map)
        }
        (_, overlay) if !overlay.is_null() => overlay.clone(),
        (base, _) => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn catalog_parses_services_json() {
        let catalog: ModuleCatalog = serde_json::from_value(json!({
            "services": [
                { "kind": "llm", "code": "bailian", "is_default": true,
                  "config": { "base_url": "https://dashscope.example/v1", "model": "qwen-plus" } },
                { "kind": "tts", "code": "azure", "is_default": true },
                { "kind": "vad", "code": "packet", "is_default": true }
            ]
        }))
        .expect("catalog should parse");
        assert_eq!(catalog.services.len(), 3);
        catalog.validate().expect("valid");
    }

    #[test]
    fn duplicate_defaults_rejected() {
        let catalog: ModuleCatalog = serde_json::from_value(json!({
            "services": [
                { "kind": "llm", "code": "a", "is_default": true },
                { "kind": "llm", "code": "b", "is_default": true }
            ]
        }))
        .expect("parse");
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn env_placeholders_expand() {
        std::env::set_var("KAIWA_CATALOG_TEST_KEY", "sk-123");
        let mut config = json!({
            "api_key": "${KAIWA_CATALOG_TEST_KEY}",
            "nested": { "missing": "${KAIWA_CATALOG_TEST_UNSET}" },
            "plain": "left alone"
        });
        expand_env(&mut config);
        assert_eq!(config["api_key"], "sk-123");
        assert_eq!(config["nested"]["missing"], "");
        assert_eq!(config["plain"], "left alone");
        std::env::remove_var("KAIWA_CATALOG_TEST_KEY");
    }

    #[test]
    fn merge_overlays_nested_objects() {
        let merged = merge_config(
            json!({ "base_url": "https://x", "retry": { "count": 2, "backoff_ms": 100 } }),
            &json!({ "retry": { "count": 5 }, "api_key": "k" }),
        );
        assert_eq!(merged["base_url"], "https://x");
        assert_eq!(merged["retry"]["count"], 5);
        assert_eq!(merged["retry"]["backoff_ms"], 100);
        assert_eq!(merged["api_key"], "k");
    }
}
