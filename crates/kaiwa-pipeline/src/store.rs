//! Conversation store boundary consumed by the orchestrator.
//!
//! The concrete SQLite implementation lives in the server crate; the
//! orchestrator only sees these traits so tests can run against in-memory
//! fakes.

use async_trait::async_trait;
use serde_json::Value;

use kaiwa_core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub agent_id: i64,
    pub role: Role,
    pub content: String,
    /// Present only for transcribed user speech.
    pub audio_path: Option<String>,
    pub emotion: Option<String>,
    pub copilot_mode: bool,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    pub agent_id: i64,
    pub role: Role,
    pub content: String,
    pub audio_path: Option<String>,
    pub emotion: Option<String>,
    pub copilot_mode: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct CompressedEntry {
    pub id: i64,
    pub agent_id: i64,
    pub copilot_mode: bool,
    pub content: String,
    pub content_last_time_ms: i64,
}

/// Newest messages oldest-first plus the compressed rollup that precedes them.
#[derive(Debug, Clone, Default)]
pub struct RecentWindow {
    pub compressed: Option<CompressedEntry>,
    pub messages: Vec<StoredMessage>,
}

/// Condenses old messages into a compressed-history row.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[StoredMessage]) -> Result<String>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Atomic append; returns the message id.
    async fn append_message(&self, message: NewMessage) -> Result<i64>;

    async fn recent_window(
        &self,
        agent_id: i64,
        copilot_mode: bool,
        limit: usize,
    ) -> Result<RecentWindow>;

    /// Compress history beyond the retention threshold. Idempotent when
    /// already within threshold; returns whether a compaction ran. Takes a
    /// per-(agent, copilot) advisory lock so concurrent sessions cannot
    /// double-compress one range.
    async fn compact_if_needed(
        &self,
        agent_id: i64,
        copilot_mode: bool,
        summarizer: &dyn Summarizer,
    ) -> Result<bool>;

    /// Persist a complete user utterance; returns the stored audio path.
    async fn save_user_audio(&self, session_id: &str, opus: &[u8]) -> Result<String>;

    async fn load_memory(&self, agent_id: i64) -> Result<Value>;

    async fn save_memory(&self, agent_id: i64, data: &Value) -> Result<()>;

    /// Queue the post-session analysis job (non-copilot sessions only).
    async fn enqueue_session_analysis(&self, session_id: &str, agent_id: i64) -> Result<()>;
}
