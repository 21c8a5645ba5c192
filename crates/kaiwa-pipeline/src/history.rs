//! Prompt assembly for the LLM call.
//!
//! Order is fixed: character system prompt (templated with the child's
//! profile), the latest compressed-history rollup, the recent raw window
//! oldest-first, then the new user turn.

use serde_json::{json, Value};

use kaiwa_core::config::{AgentConfig, Profile};
use kaiwa_core::Result;

use crate::store::{ConversationStore, RecentWindow, Role};

/// Default raw window size.
pub const WINDOW_SIZE: usize = 20;

/// Fill `{{...}}` placeholders from the child profile. Unknown placeholders
/// are left in place so a typo is visible instead of silently empty.
pub fn render_prompt(template: &str, profile: &Profile) -> String {
    let pairs = [
        ("{{child_name}}", profile.child_info.name.as_str()),
        ("{{child_gender}}", profile.child_info.gender.as_str()),
        ("{{child_birth_date}}", profile.child_info.birth_date.as_str()),
        ("{{character_name}}", profile.character.name.as_str()),
        ("{{name}}", profile.character.name.as_str()),
    ];
    let mut out = template.to_string();
    for (key, value) in pairs {
        if out.contains(key) {
            out = out.replace(key, value);
        }
    }
    out
}

/// System prompt for the active track.
pub fn system_prompt(config: &AgentConfig, copilot_mode: bool) -> String {
    let template = if copilot_mode {
        config
            .copilot_prompt()
            .unwrap_or(config.profile.character.prompt.as_str())
    } else {
        config.profile.character.prompt.as_str()
    };
    render_prompt(template, &config.profile)
}

/// Build the chat-completion message array for one turn.
pub async fn assemble_messages(
    store: &dyn ConversationStore,
    config: &AgentConfig,
    agent_id: i64,
    copilot_mode: bool,
    user_text: &str,
) -> Result<Vec<Value>> {
    let window = store.recent_window(agent_id, copilot_mode, WINDOW_SIZE).await?;
    Ok(compose(config, copilot_mode, &window, user_text))
}

pub fn compose(
    config: &AgentConfig,
    copilot_mode: bool,
    window: &RecentWindow,
    user_text: &str,
) -> Vec<Value> {
    let mut messages = Vec::with_capacity(window.messages.len() + 3);
    messages.push(json!({
        "role": "system",
        "content": system_prompt(config, copilot_mode),
    }));

    if let Some(compressed) = &window.compressed {
        messages.push(json!({
            "role": "system",
            "content": format!("早前对话的摘要：{}", compressed.content),
        }));
    }

    for message in &window.messages {
        messages.push(json!({
            "role": match message.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            "content": message.content,
        }));
    }

    messages.push(json!({ "role": "user", "content": user_text }));
    messages
}

/// Rough prompt size for metrics input-char accounting.
pub fn message_chars(messages: &[Value]) -> usize {
    messages
        .iter()
        .filter_map(|m| m.get("content").and_then(Value::as_str))
        .map(str::len)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CompressedEntry, StoredMessage};

    fn config() -> AgentConfig {
        let mut config = AgentConfig::default();
        config.profile.character.name = "星星".to_string();
        config.profile.character.prompt = "你是{{name}}，{{child_name}}的伙伴。".to_string();
        config.profile.child_info.name = "小雨".to_string();
        config
    }

    fn message(id: i64, role: Role, content: &str) -> StoredMessage {
        StoredMessage {
            id,
            session_id: "S1".to_string(),
            agent_id: 1,
            role,
            content: content.to_string(),
            audio_path: None,
            emotion: None,
            copilot_mode: false,
            created_at_ms: id,
        }
    }

    #[test]
    fn template_fills_profile_fields() {
        let rendered = system_prompt(&config(), false);
        assert_eq!(rendered, "你是星星，小雨的伙伴。");
    }

    #[test]
    fn unknown_placeholders_survive() {
        let rendered = render_prompt("今天是{{weekday}}", &config().profile);
        assert_eq!(rendered, "今天是{{weekday}}");
    }

    #[test]
    fn copilot_mode_prefers_override_prompt() {
        let mut config = config();
        config
            .extra
            .insert("copilot_prompt".to_string(), serde_json::json!("你是领航员"));
        assert_eq!(system_prompt(&config, true), "你是领航员");
        assert_eq!(system_prompt(&config, false), "你是星星，小雨的伙伴。");
    }

    #[test]
    fn compose_orders_sections() {
        let window = RecentWindow {
            compressed: Some(CompressedEntry {
                id: 1,
                agent_id: 1,
                copilot_mode: false,
                content: "之前聊了恐龙".to_string(),
                content_last_time_ms: 10,
            }),
            messages: vec![
                message(11, Role::User, "讲个故事"),
                message(12, Role::Assistant, "从前有座山。"),
            ],
        };
        let messages = compose(&config(), false, &window, "后来呢");
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0]["role"], "system");
        assert!(messages[1]["content"].as_str().expect("str").contains("恐龙"));
        assert_eq!(messages[2]["content"], "讲个故事");
        assert_eq!(messages[3]["role"], "assistant");
        assert_eq!(messages[4]["content"], "后来呢");
    }
}
