//! Message log, compressed history and session rows.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;
use uuid::Uuid;

use kaiwa_core::Result;
use kaiwa_pipeline::{
    CompressedEntry, ConversationStore, NewMessage, RecentWindow, Role, StoredMessage, Summarizer,
};

use super::{
    now_unix_millis, storage_err, Store, COMPACT_KEEP_TAIL, COMPACT_THRESHOLD,
    COMPACT_TOKEN_THRESHOLD,
};

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionRow {
    pub session_id: String,
    pub user_id: i64,
    pub agent_id: i64,
    pub copilot_mode: bool,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(3)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        role: if role == "assistant" { Role::Assistant } else { Role::User },
        content: row.get(4)?,
        audio_path: row.get(5)?,
        emotion: row.get(6)?,
        copilot_mode: row.get::<_, i64>(7)? != 0,
        created_at_ms: row.get(8)?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, session_id, agent_id, role, content, audio_path, emotion, copilot_mode, created_at";

impl Store {
    pub async fn create_session(
        &self,
        user_id: i64,
        agent_id: i64,
        copilot_mode: bool,
        session_id: Option<String>,
    ) -> anyhow::Result<SessionRow> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.run_blocking(move |conn| {
            let now = now_unix_millis();
            conn.execute(
                "INSERT INTO sessions (session_id, user_id, agent_id, copilot_mode, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?5)",
                params![session_id, user_id, agent_id, copilot_mode as i64, now],
            )?;
            Ok(SessionRow {
                session_id,
                user_id,
                agent_id,
                copilot_mode,
                status: "open".to_string(),
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> anyhow::Result<Option<SessionRow>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT session_id, user_id, agent_id, copilot_mode, status, created_at, updated_at
                     FROM sessions WHERE session_id = ?1",
                    params![session_id],
                    |row| {
                        Ok(SessionRow {
                            session_id: row.get(0)?,
                            user_id: row.get(1)?,
                            agent_id: row.get(2)?,
                            copilot_mode: row.get::<_, i64>(3)? != 0,
                            status: row.get(4)?,
                            created_at: row.get(5)?,
                            updated_at: row.get(6)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    pub async fn list_sessions(&self, user_id: i64) -> anyhow::Result<Vec<SessionRow>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, user_id, agent_id, copilot_mode, status, created_at, updated_at
                 FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                Ok(SessionRow {
                    session_id: row.get(0)?,
                    user_id: row.get(1)?,
                    agent_id: row.get(2)?,
                    copilot_mode: row.get::<_, i64>(3)? != 0,
                    status: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?);
            }
            Ok(sessions)
        })
        .await
    }

    pub async fn delete_session(&self, session_id: &str) -> anyhow::Result<bool> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM chat_messages WHERE session_id = ?1", params![session_id])?;
            let deleted = tx.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])?;
            tx.commit()?;
            Ok(deleted > 0)
        })
        .await
    }

    pub async fn session_messages(&self, session_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE session_id = ?1 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![session_id], map_message)?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
    }

    pub async fn close_session(&self, session_id: &str) -> anyhow::Result<()> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE sessions SET status = 'closed', updated_at = ?1 WHERE session_id = ?2",
                params![now_unix_millis(), session_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Raw messages for one agent track, oldest first (workers use this).
    pub async fn agent_messages_between(
        &self,
        agent_id: i64,
        copilot_mode: bool,
        from_ms: i64,
        to_ms: i64,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE agent_id = ?1 AND copilot_mode = ?2
                   AND created_at >= ?3 AND created_at < ?4
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(
                params![agent_id, copilot_mode as i64, from_ms, to_ms],
                map_message,
            )?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            Ok(messages)
        })
        .await
    }
}

#[async_trait]
impl ConversationStore for Store {
    async fn append_message(&self, message: NewMessage) -> Result<i64> {
        self.run_blocking(move |conn| {
            // Strictly increasing created_at: bursts land inside one
            // millisecond, and the compaction boundary is a timestamp cut.
            let max_prev: Option<i64> = conn.query_row(
                "SELECT MAX(created_at) FROM chat_messages",
                [],
                |row| row.get(0),
            )?;
            let now = now_unix_millis().max(max_prev.unwrap_or(0) + 1);
            conn.execute(
                "INSERT INTO chat_messages
                     (session_id, agent_id, role, content, audio_path, emotion, copilot_mode, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.session_id,
                    message.agent_id,
                    message.role.as_str(),
                    message.content,
                    message.audio_path,
                    message.emotion,
                    message.copilot_mode as i64,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2",
                params![now, message.session_id],
            )?;
            Ok(id)
        })
        .await
        .map_err(storage_err)
    }

    async fn recent_window(
        &self,
        agent_id: i64,
        copilot_mode: bool,
        limit: usize,
    ) -> Result<RecentWindow> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                 WHERE agent_id = ?1 AND copilot_mode = ?2
                 ORDER BY created_at DESC, id DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![agent_id, copilot_mode as i64, limit as i64],
                map_message,
            )?;
            let mut messages = Vec::new();
            for row in rows {
                messages.push(row?);
            }
            messages.reverse();

            let window_start = messages.first().map(|m| m.created_at_ms).unwrap_or(i64::MAX);
            let compressed = conn
                .query_row(
                    "SELECT id, agent_id, copilot_mode, content, content_last_time
                     FROM compressed_history
                     WHERE agent_id = ?1 AND copilot_mode = ?2 AND content_last_time < ?3
                     ORDER BY content_last_time DESC LIMIT 1",
                    params![agent_id, copilot_mode as i64, window_start],
                    |row| {
                        Ok(CompressedEntry {
                            id: row.get(0)?,
                            agent_id: row.get(1)?,
                            copilot_mode: row.get::<_, i64>(2)? != 0,
                            content: row.get(3)?,
                            content_last_time_ms: row.get(4)?,
                        })
                    },
                )
                .optional()?;

            Ok(RecentWindow { compressed, messages })
        })
        .await
        .map_err(storage_err)
    }

    async fn compact_if_needed(
        &self,
        agent_id: i64,
        copilot_mode: bool,
        summarizer: &dyn Summarizer,
    ) -> Result<bool> {
        let lock = self.compaction_lock(agent_id, copilot_mode).await;
        let _guard = lock.lock().await;

        // Re-check under the lock; a concurrent session may just have
        // compacted this track.
        let candidates = self
            .run_blocking(move |conn| {
                let (count, chars): (i64, i64) = conn.query_row(
                    "SELECT COUNT(1), COALESCE(SUM(LENGTH(content)), 0)
                     FROM chat_messages WHERE agent_id = ?1 AND copilot_mode = ?2",
                    params![agent_id, copilot_mode as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                let over_count = count as usize > COMPACT_THRESHOLD;
                let over_tokens = (chars as usize) / 4 > COMPACT_TOKEN_THRESHOLD;
                if !over_count && !over_tokens {
                    return Ok(Vec::new());
                }

                let take = (count as usize).saturating_sub(COMPACT_KEEP_TAIL);
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM chat_messages
                     WHERE agent_id = ?1 AND copilot_mode = ?2
                     ORDER BY created_at ASC, id ASC LIMIT ?3"
                ))?;
                let rows = stmt.query_map(
                    params![agent_id, copilot_mode as i64, take as i64],
                    map_message,
                )?;
                let mut messages = Vec::new();
                for row in rows {
                    messages.push(row?);
                }
                Ok(messages)
            })
            .await
            .map_err(storage_err)?;

        if candidates.is_empty() {
            return Ok(false);
        }

        let summary = summarizer.summarize(&candidates).await?;
        let last_time = candidates.last().map(|m| m.created_at_ms).unwrap_or(0);
        let ids: Vec<i64> = candidates.iter().map(|m| m.id).collect();
        let ids_len = ids.len();

        // Summary insert and raw-row deletion commit together.
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            let max_existing: Option<i64> = tx
                .query_row(
                    "SELECT MAX(content_last_time) FROM compressed_history
                     WHERE agent_id = ?1 AND copilot_mode = ?2",
                    params![agent_id, copilot_mode as i64],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            if let Some(existing) = max_existing {
                // content_last_time must advance strictly.
                anyhow::ensure!(
                    last_time > existing,
                    "compaction range overlaps existing rollup"
                );
            }
            tx.execute(
                "INSERT INTO compressed_history (agent_id, copilot_mode, content, content_last_time, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![agent_id, copilot_mode as i64, summary, last_time, now_unix_millis()],
            )?;
            for chunk in ids.chunks(512) {
                let placeholders = vec!["?"; chunk.len()].join(",");
                let sql = format!("DELETE FROM chat_messages WHERE id IN ({placeholders})");
                tx.execute(&sql, rusqlite::params_from_iter(chunk.iter()))?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(storage_err)?;

        tracing::info!(
            agent_id,
            copilot_mode,
            compacted = ids_len,
            "chat history compacted"
        );
        Ok(true)
    }

    async fn save_user_audio(&self, session_id: &str, opus: &[u8]) -> Result<String> {
        let dir = self.audio_dir().join(session_id);
        let file = dir.join(format!("{}.opus", Uuid::new_v4().simple()));
        let bytes = opus.to_vec();
        let path = file.to_string_lossy().to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&dir)?;
            std::fs::write(&file, bytes)?;
            Ok(())
        })
        .await
        .map_err(|err| kaiwa_core::Error::Storage(err.to_string()))?
        .map_err(storage_err)?;
        Ok(path)
    }

    async fn load_memory(&self, agent_id: i64) -> Result<Value> {
        self.run_blocking(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT memory_data FROM agent_instances WHERE id = ?1",
                    params![agent_id],
                    |row| row.get(0),
                )
                .optional()?;
            let value = raw
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_else(|| serde_json::json!({}));
            Ok(value)
        })
        .await
        .map_err(storage_err)
    }

    async fn save_memory(&self, agent_id: i64, data: &Value) -> Result<()> {
        let raw = data.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE agent_instances SET memory_data = ?1, updated_at = ?2 WHERE id = ?3",
                params![raw, now_unix_millis(), agent_id],
            )?;
            Ok(())
        })
        .await
        .map_err(storage_err)
    }

    async fn enqueue_session_analysis(&self, session_id: &str, agent_id: i64) -> Result<()> {
        self.create_analysis_task(session_id, agent_id)
            .await
            .map_err(storage_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, messages: &[StoredMessage]) -> Result<String> {
            Ok(format!("{}条消息的摘要", messages.len()))
        }
    }

    async fn seed_messages(store: &Store, agent_id: i64, count: usize) {
        for i in 0..count {
            store
                .append_message(NewMessage {
                    session_id: "S1".to_string(),
                    agent_id,
                    role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                    content: format!("消息{i}"),
                    audio_path: None,
                    emotion: None,
                    copilot_mode: false,
                })
                .await
                .expect("append");
        }
    }

    #[tokio::test]
    async fn append_preserves_monotonic_order() {
        let (store, _dir) = test_store();
        seed_messages(&store, 1, 10).await;
        let window = store.recent_window(1, false, 20).await.expect("window");
        assert_eq!(window.messages.len(), 10);
        for pair in window.messages.windows(2) {
            assert!(pair[0].created_at_ms <= pair[1].created_at_ms);
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[tokio::test]
    async fn recent_window_limits_and_orders_oldest_first() {
        let (store, _dir) = test_store();
        seed_messages(&store, 1, 30).await;
        let window = store.recent_window(1, false, 20).await.expect("window");
        assert_eq!(window.messages.len(), 20);
        assert_eq!(window.messages[0].content, "消息10");
        assert_eq!(window.messages[19].content, "消息29");
    }

    #[tokio::test]
    async fn copilot_history_is_segregated() {
        let (store, _dir) = test_store();
        seed_messages(&store, 1, 4).await;
        store
            .append_message(NewMessage {
                session_id: "S1".to_string(),
                agent_id: 1,
                role: Role::User,
                content: "领航员消息".to_string(),
                audio_path: None,
                emotion: None,
                copilot_mode: true,
            })
            .await
            .expect("append");

        let normal = store.recent_window(1, false, 50).await.expect("window");
        let copilot = store.recent_window(1, true, 50).await.expect("window");
        assert_eq!(normal.messages.len(), 4);
        assert_eq!(copilot.messages.len(), 1);
        assert_eq!(copilot.messages[0].content, "领航员消息");
    }

    #[tokio::test]
    async fn compaction_respects_threshold_and_boundary() {
        let (store, _dir) = test_store();
        seed_messages(&store, 7, 200).await;

        let compacted = store
            .compact_if_needed(7, false, &FixedSummarizer)
            .await
            .expect("compact");
        assert!(compacted);

        let window = store.recent_window(7, false, 500).await.expect("window");
        assert!(window.messages.len() <= COMPACT_THRESHOLD);
        assert_eq!(window.messages.len(), COMPACT_KEEP_TAIL);

        let compressed = window.compressed.expect("rollup row present");
        assert!(compressed.content.contains("150"));

        // No raw messages at or before the rollup boundary survive.
        let oldest_raw = window.messages.first().expect("messages").created_at_ms;
        assert!(oldest_raw > compressed.content_last_time_ms);
    }

    #[tokio::test]
    async fn compaction_is_idempotent_within_threshold() {
        let (store, _dir) = test_store();
        seed_messages(&store, 7, 200).await;

        assert!(store.compact_if_needed(7, false, &FixedSummarizer).await.expect("first"));
        assert!(!store.compact_if_needed(7, false, &FixedSummarizer).await.expect("second"));

        // Exactly one rollup row.
        let window = store.recent_window(7, false, 500).await.expect("window");
        assert!(window.compressed.is_some());
    }

    #[tokio::test]
    async fn concurrent_compactions_run_once() {
        let (store, _dir) = test_store();
        seed_messages(&store, 7, 200).await;

        let a = store.clone();
        let b = store.clone();
        let (ra, rb) = tokio::join!(
            a.compact_if_needed(7, false, &FixedSummarizer),
            b.compact_if_needed(7, false, &FixedSummarizer),
        );
        let ran = [ra.expect("a"), rb.expect("b")];
        assert_eq!(ran.iter().filter(|r| **r).count(), 1, "advisory lock serializes");
    }

    #[tokio::test]
    async fn memory_round_trips() {
        let (store, _dir) = test_store();
        // agent_instances row is required for the update to land.
        store
            .run_blocking(|conn| {
                conn.execute_batch(
                    "INSERT INTO users (login_name, password_hash, created_at) VALUES ('u', 'h', 0);
                     INSERT INTO agent_templates (name, created_at) VALUES ('t', 0);
                     INSERT INTO agent_instances (user_id, template_id, name, created_at, updated_at)
                     VALUES (1, 1, 'a', 0, 0);",
                )?;
                Ok(())
            })
            .await
            .expect("seed");

        let data = serde_json::json!({ "preferences": { "current_voice": "mama" } });
        store.save_memory(1, &data).await.expect("save");
        let loaded = store.load_memory(1).await.expect("load");
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn user_audio_lands_under_session_dir() {
        let (store, _dir) = test_store();
        let path = store.save_user_audio("S9", &[1, 2, 3]).await.expect("save");
        assert!(path.contains("S9"));
        assert_eq!(std::fs::read(path).expect("file"), vec![1, 2, 3]);
    }
}
