//! Post-session analysis worker.
//!
//! Sessions enqueue an analysis row when they close; this worker claims
//! pending rows, derives the simple statistics from the message log, asks the
//! LLM for a structured read on the conversation and writes the result back.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use kaiwa_core::config::ModuleParams;
use kaiwa_core::text::strip_json_fence;
use kaiwa_modules::ModuleKind;
use kaiwa_pipeline::{Role, StoredMessage};

use crate::state::AppState;
use crate::store::AnalysisRow;

const TICK: Duration = Duration::from_secs(15);

const ANALYSIS_PROMPT: &str = "你是儿童对话分析师。根据对话记录输出JSON：\
{\"mood\": 孩子的整体情绪, \"topics\": 谈到的主题数组, \"vocabulary_note\": 语言发展观察, \
\"highlights\": 值得家长知道的点}。只输出JSON。";

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match state.store.claim_analysis_task().await {
                Ok(Some(row)) => {
                    if let Err(err) = analyze(&state, &row).await {
                        warn!(session = %row.session_id, error = %err, "session analysis failed");
                        if let Err(err) = state.store.fail_analysis(row.id).await {
                            warn!(error = %err, "failed to record analysis failure");
                        }
                    }
                    // Drain the queue without sleeping between jobs.
                    continue;
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "failed to claim analysis task"),
            }
            tokio::time::sleep(TICK).await;
        }
    })
}

async fn analyze(state: &AppState, row: &AnalysisRow) -> anyhow::Result<()> {
    let messages = state.store.session_messages(&row.session_id).await?;
    if messages.is_empty() {
        state
            .store
            .complete_analysis(row.id, 0.0, 0.0, &json!({ "empty_session": true }))
            .await?;
        return Ok(());
    }

    let duration_secs = (messages.last().expect("non-empty").created_at_ms
        - messages.first().expect("non-empty").created_at_ms) as f64
        / 1000.0;
    let avg_child_utterance_len = average_user_chars(&messages);

    let result = run_llm_analysis(state, &messages).await?;
    state
        .store
        .complete_analysis(row.id, duration_secs, avg_child_utterance_len, &result)
        .await?;
    debug!(session = %row.session_id, "session analysis completed");
    Ok(())
}

fn average_user_chars(messages: &[StoredMessage]) -> f64 {
    let user_lengths: Vec<usize> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.chars().count())
        .collect();
    if user_lengths.is_empty() {
        return 0.0;
    }
    user_lengths.iter().sum::<usize>() as f64 / user_lengths.len() as f64
}

async fn run_llm_analysis(
    state: &AppState,
    messages: &[StoredMessage],
) -> anyhow::Result<Value> {
    let llm = state
        .registry
        .resolve(ModuleKind::Llm, &ModuleParams::default())
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    let transcript = messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let response = llm
        .call(
            "chat_completion",
            json!({
                "messages": [
                    { "role": "system", "content": ANALYSIS_PROMPT },
                    { "role": "user", "content": transcript }
                ],
                "max_tokens": 800,
                "temperature": 1.0,
            }),
        )
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    let content = response
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    // Models sometimes fence the JSON; tolerate, fall back to raw text.
    Ok(strip_json_fence(content).unwrap_or_else(|_| json!({ "raw": content })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: Role, content: &str, at: i64) -> StoredMessage {
        StoredMessage {
            id: at,
            session_id: "S1".to_string(),
            agent_id: 1,
            role,
            content: content.to_string(),
            audio_path: None,
            emotion: None,
            copilot_mode: false,
            created_at_ms: at,
        }
    }

    #[test]
    fn average_counts_only_user_messages() {
        let messages = vec![
            message(Role::User, "恐龙", 0),
            message(Role::Assistant, "恐龙是很久以前的动物。", 10),
            message(Role::User, "它们吃什么呀", 20),
        ];
        let avg = average_user_chars(&messages);
        assert!((avg - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn average_of_no_user_messages_is_zero() {
        let messages = vec![message(Role::Assistant, "你好", 0)];
        assert_eq!(average_user_chars(&messages), 0.0);
    }
}
