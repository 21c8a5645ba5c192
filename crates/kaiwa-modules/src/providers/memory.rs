//! Agent memory module: free-form JSON persisted across sessions.
//!
//! Holds each agent's `memory_data` blob in process; the orchestrator seeds
//! it from the store when a session attaches and exports it back on close.
//! Paths are dotted (`preferences.current_voice`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Mutex;

use kaiwa_core::{Error, Result};

use crate::module::{unknown_tool, Module, ModuleFactory, ToolSpec};

pub struct AgentMemoryFactory;

impl ModuleFactory for AgentMemoryFactory {
    fn create(&self, _config: Value) -> Result<Arc<dyn Module>> {
        Ok(Arc::new(AgentMemoryModule {
            blobs: Mutex::new(HashMap::new()),
        }))
    }
}

#[derive(Debug)]
pub struct AgentMemoryModule {
    blobs: Mutex<HashMap<i64, Value>>,
}

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn set_path(root: &mut Value, path: &str, value: Value) {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let mut current = root;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        let map = current.as_object_mut().expect("object ensured above");
        if i == parts.len() - 1 {
            map.insert((*part).to_string(), value);
            return;
        }
        let next = map
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            *next = Value::Object(Map::new());
        }
        current = next;
    }
}

fn agent_id(args: &Value) -> Result<i64> {
    args.get("agent_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::provider_fatal("agent_memory", "missing agent_id"))
}

#[async_trait]
impl Module for AgentMemoryModule {
    fn name(&self) -> &str {
        "agent_memory"
    }

    fn description(&self) -> &str {
        "Per-agent free-form memory blob with dotted-path access"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec::new(
                "get",
                "Read a memory value by dotted path; whole blob when path is omitted.",
                json!({
                    "type": "object",
                    "properties": {
                        "agent_id": { "type": "integer" },
                        "path": { "type": "string" }
                    },
                    "required": ["agent_id"]
                }),
            ),
            ToolSpec::new(
                "set",
                "Write a memory value at a dotted path, creating parents.",
                json!({
                    "type": "object",
                    "properties": {
                        "agent_id": { "type": "integer" },
                        "path": { "type": "string" },
                        "value": {}
                    },
                    "required": ["agent_id", "path", "value"]
                }),
            ),
            ToolSpec::new(
                "import",
                "Replace an agent's whole memory blob.",
                json!({
                    "type": "object",
                    "properties": {
                        "agent_id": { "type": "integer" },
                        "data": { "type": "object" }
                    },
                    "required": ["agent_id", "data"]
                }),
            ),
        ]
    }

    async fn call(&self, tool: &str, args: Value) -> Result<Value> {
        let agent = agent_id(&args)?;
        let mut blobs = self.blobs.lock().expect("memory state poisoned");

        match tool {
            "get" => {
                let blob = blobs.entry(agent).or_insert_with(|| json!({}));
                match args.get("path").and_then(Value::as_str) {
                    Some(path) => Ok(get_path(blob, path).cloned().unwrap_or(Value::Null)),
                    None => Ok(blob.clone()),
                }
            }
            "set" => {
                let path = args
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::provider_fatal(self.name(), "missing path"))?;
                let value = args.get("value").cloned().unwrap_or(Value::Null);
                let blob = blobs.entry(agent).or_insert_with(|| json!({}));
                set_path(blob, path, value);
                Ok(json!({ "ok": true }))
            }
            "import" => {
                let data = args
                    .get("data")
                    .cloned()
                    .ok_or_else(|| Error::provider_fatal(self.name(), "missing data"))?;
                blobs.insert(agent, data);
                Ok(json!({ "ok": true }))
            }
            other => Err(unknown_tool(self.name(), other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips_dotted_paths() {
        let module = AgentMemoryFactory.create(json!({})).expect("create");
        module
            .call(
                "set",
                json!({ "agent_id": 7, "path": "preferences.current_voice", "value": "mama" }),
            )
            .await
            .expect("set");

        let value = module
            .call("get", json!({ "agent_id": 7, "path": "preferences.current_voice" }))
            .await
            .expect("get");
        assert_eq!(value, json!("mama"));

        let blob = module.call("get", json!({ "agent_id": 7 })).await.expect("get blob");
        assert_eq!(blob["preferences"]["current_voice"], "mama");
    }

    #[tokio::test]
    async fn import_replaces_blob() {
        let module = AgentMemoryFactory.create(json!({})).expect("create");
        module
            .call("import", json!({ "agent_id": 1, "data": { "likes": ["恐龙"] } }))
            .await
            .expect("import");
        let value = module
            .call("get", json!({ "agent_id": 1, "path": "likes" }))
            .await
            .expect("get");
        assert_eq!(value, json!(["恐龙"]));
    }

    #[tokio::test]
    async fn missing_path_on_get_returns_null() {
        let module = AgentMemoryFactory.create(json!({})).expect("create");
        let value = module
            .call("get", json!({ "agent_id": 2, "path": "nothing.here" }))
            .await
            .expect("get");
        assert_eq!(value, Value::Null);
    }
}
