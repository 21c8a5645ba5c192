//! Agent templates and user-owned instances.

use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::{now_unix_millis, Store};

#[derive(Debug, Clone, serde::Serialize)]
pub struct TemplateRow {
    pub id: i64,
    pub name: String,
    pub avatar: String,
    pub device_type: String,
    pub module_params: Value,
    pub agent_config: Value,
    /// 0 marks a system template.
    pub creator_id: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentRow {
    pub id: i64,
    pub user_id: i64,
    pub template_id: i64,
    pub name: String,
    pub module_params: Value,
    pub agent_config: Value,
    pub memory_data: Value,
    pub device_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

fn parse_json(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({}))
}

fn map_template(row: &Row<'_>) -> rusqlite::Result<TemplateRow> {
    Ok(TemplateRow {
        id: row.get(0)?,
        name: row.get(1)?,
        avatar: row.get(2)?,
        device_type: row.get(3)?,
        module_params: parse_json(row.get(4)?),
        agent_config: parse_json(row.get(5)?),
        creator_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn map_agent(row: &Row<'_>) -> rusqlite::Result<AgentRow> {
    Ok(AgentRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        template_id: row.get(2)?,
        name: row.get(3)?,
        module_params: parse_json(row.get(4)?),
        agent_config: parse_json(row.get(5)?),
        memory_data: parse_json(row.get(6)?),
        device_id: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const TEMPLATE_COLUMNS: &str =
    "id, name, avatar, device_type, module_params, agent_config, creator_id, created_at";
const AGENT_COLUMNS: &str = "id, user_id, template_id, name, module_params, agent_config, \
     memory_data, device_id, created_at, updated_at";

impl Store {
    pub async fn list_templates(&self) -> anyhow::Result<Vec<TemplateRow>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TEMPLATE_COLUMNS} FROM agent_templates ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map([], map_template)?;
            let mut templates = Vec::new();
            for row in rows {
                templates.push(row?);
            }
            Ok(templates)
        })
        .await
    }

    pub async fn create_template(
        &self,
        name: &str,
        device_type: &str,
        module_params: &Value,
        agent_config: &Value,
        creator_id: i64,
    ) -> anyhow::Result<i64> {
        let name = name.to_string();
        let device_type = device_type.to_string();
        let module_params = module_params.to_string();
        let agent_config = agent_config.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO agent_templates (name, avatar, device_type, module_params, agent_config, creator_id, created_at)
                 VALUES (?1, '', ?2, ?3, ?4, ?5, ?6)",
                params![name, device_type, module_params, agent_config, creator_id, now_unix_millis()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_template(&self, id: i64) -> anyhow::Result<Option<TemplateRow>> {
        self.run_blocking(move |conn| {
            let template = conn
                .query_row(
                    &format!("SELECT {TEMPLATE_COLUMNS} FROM agent_templates WHERE id = ?1"),
                    params![id],
                    map_template,
                )
                .optional()?;
            Ok(template)
        })
        .await
    }

    /// Instantiate a template for a user; the instance starts with the
    /// template's params and config and may override them later.
    pub async fn create_agent(
        &self,
        user_id: i64,
        template: &TemplateRow,
        name: Option<String>,
    ) -> anyhow::Result<AgentRow> {
        let name = name.unwrap_or_else(|| template.name.clone());
        let module_params = template.module_params.to_string();
        let agent_config = template.agent_config.to_string();
        let template_id = template.id;
        self.run_blocking(move |conn| {
            let now = now_unix_millis();
            conn.execute(
                "INSERT INTO agent_instances
                     (user_id, template_id, name, module_params, agent_config, memory_data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, '{}', ?6, ?6)",
                params![user_id, template_id, name, module_params, agent_config, now],
            )?;
            let id = conn.last_insert_rowid();
            conn.query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agent_instances WHERE id = ?1"),
                params![id],
                map_agent,
            )
            .map_err(Into::into)
        })
        .await
    }

    pub async fn get_agent(&self, id: i64) -> anyhow::Result<Option<AgentRow>> {
        self.run_blocking(move |conn| {
            let agent = conn
                .query_row(
                    &format!("SELECT {AGENT_COLUMNS} FROM agent_instances WHERE id = ?1"),
                    params![id],
                    map_agent,
                )
                .optional()?;
            Ok(agent)
        })
        .await
    }

    /// An agent is visible only to its owner.
    pub async fn get_agent_for_user(
        &self,
        id: i64,
        user_id: i64,
    ) -> anyhow::Result<Option<AgentRow>> {
        Ok(self
            .get_agent(id)
            .await?
            .filter(|agent| agent.user_id == user_id))
    }

    pub async fn list_agents(&self, user_id: i64) -> anyhow::Result<Vec<AgentRow>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {AGENT_COLUMNS} FROM agent_instances WHERE user_id = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt.query_map(params![user_id], map_agent)?;
            let mut agents = Vec::new();
            for row in rows {
                agents.push(row?);
            }
            Ok(agents)
        })
        .await
    }

    pub async fn update_agent(
        &self,
        id: i64,
        name: Option<String>,
        module_params: Option<Value>,
        agent_config: Option<Value>,
    ) -> anyhow::Result<bool> {
        self.run_blocking(move |conn| {
            let now = now_unix_millis();
            let mut updated = 0;
            if let Some(name) = name {
                updated += conn.execute(
                    "UPDATE agent_instances SET name = ?1, updated_at = ?2 WHERE id = ?3",
                    params![name, now, id],
                )?;
            }
            if let Some(module_params) = module_params {
                updated += conn.execute(
                    "UPDATE agent_instances SET module_params = ?1, updated_at = ?2 WHERE id = ?3",
                    params![module_params.to_string(), now, id],
                )?;
            }
            if let Some(agent_config) = agent_config {
                updated += conn.execute(
                    "UPDATE agent_instances SET agent_config = ?1, updated_at = ?2 WHERE id = ?3",
                    params![agent_config.to_string(), now, id],
                )?;
            }
            Ok(updated > 0)
        })
        .await
    }

    pub async fn delete_agent(&self, id: i64) -> anyhow::Result<bool> {
        self.run_blocking(move |conn| {
            let deleted = conn.execute("DELETE FROM agent_instances WHERE id = ?1", params![id])?;
            Ok(deleted > 0)
        })
        .await
    }

    /// Agent ids with any activity, for the summary scheduler.
    pub async fn all_agent_ids(&self) -> anyhow::Result<Vec<i64>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM agent_instances ORDER BY id ASC")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use serde_json::json;

    async fn seed(store: &Store) -> (i64, TemplateRow) {
        let user = store.create_user("u", "h", "").await.expect("user");
        let template_id = store
            .create_template(
                "星星伙伴",
                "speaker",
                &json!({ "llm": { "code": "bailian" } }),
                &json!({ "profile": { "character": { "name": "星星" } } }),
                0,
            )
            .await
            .expect("template");
        let template = store
            .get_template(template_id)
            .await
            .expect("query")
            .expect("present");
        (user.id, template)
    }

    #[tokio::test]
    async fn instance_inherits_template_blobs() {
        let (store, _dir) = test_store();
        let (user_id, template) = seed(&store).await;

        let agent = store
            .create_agent(user_id, &template, None)
            .await
            .expect("create");
        assert_eq!(agent.name, "星星伙伴");
        assert_eq!(agent.module_params["llm"]["code"], "bailian");
        assert_eq!(agent.agent_config["profile"]["character"]["name"], "星星");
        assert_eq!(agent.memory_data, json!({}));
    }

    #[tokio::test]
    async fn agent_visibility_is_owner_scoped() {
        let (store, _dir) = test_store();
        let (user_id, template) = seed(&store).await;
        let other = store.create_user("other", "h", "").await.expect("user");

        let agent = store
            .create_agent(user_id, &template, Some("我的".to_string()))
            .await
            .expect("create");
        assert!(store
            .get_agent_for_user(agent.id, user_id)
            .await
            .expect("query")
            .is_some());
        assert!(store
            .get_agent_for_user(agent.id, other.id)
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn update_overrides_config() {
        let (store, _dir) = test_store();
        let (user_id, template) = seed(&store).await;
        let agent = store.create_agent(user_id, &template, None).await.expect("create");

        store
            .update_agent(
                agent.id,
                None,
                None,
                Some(json!({ "audio_settings": { "listen_mode": "realtime" } })),
            )
            .await
            .expect("update");
        let reloaded = store.get_agent(agent.id).await.expect("query").expect("present");
        assert_eq!(
            reloaded.agent_config["audio_settings"]["listen_mode"],
            "realtime"
        );
    }
}
