//! SQLite persistence.
//!
//! One database file, connections opened per operation on the blocking pool.
//! WAL keeps interactive writes cheap while the compaction and summary
//! workers run their longer transactions on their own connections.

mod agents;
mod analysis;
mod conversation;
mod devices;
mod growth;
mod metrics;
mod users;
mod voice;

pub use agents::{AgentRow, TemplateRow};
pub use analysis::AnalysisRow;
pub use conversation::SessionRow;
pub use devices::{BindOutcome, DeviceRow};
pub use growth::{GrowthRow, SummaryType};
pub use users::UserRow;
pub use voice::VoiceCloneRow;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tokio::task;

/// Raw message retention before compaction kicks in.
pub const COMPACT_THRESHOLD: usize = 150;
/// Newest raw messages kept out of every compaction.
pub const COMPACT_KEEP_TAIL: usize = 50;
/// Estimated-token trigger (chars / 4) for long-content histories.
pub const COMPACT_TOKEN_THRESHOLD: usize = 8_000;
/// Analysis jobs give up after this many failures and need a manual reset.
pub const ANALYSIS_MAX_RETRIES: i64 = 3;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    login_name TEXT NOT NULL UNIQUE,
    login_type TEXT NOT NULL DEFAULT 'password',
    display_name TEXT NOT NULL DEFAULT '',
    password_hash TEXT NOT NULL,
    profile TEXT NOT NULL DEFAULT '{}',
    status INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_uuid TEXT NOT NULL UNIQUE,
    device_type TEXT NOT NULL CHECK(device_type IN ('speaker','display','robot','vehicle','wearable')),
    battery INTEGER NOT NULL DEFAULT 0,
    charging INTEGER NOT NULL DEFAULT 0,
    volume INTEGER NOT NULL DEFAULT 60,
    brightness INTEGER NOT NULL DEFAULT 80,
    wifi_ssid TEXT NULL,
    online INTEGER NOT NULL DEFAULT 0,
    last_active_at INTEGER NULL,
    bind_challenge TEXT NULL,
    challenge_expires_at INTEGER NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS user_devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    device_id INTEGER NOT NULL REFERENCES devices(id),
    is_owner INTEGER NOT NULL DEFAULT 0,
    UNIQUE(user_id, device_id)
);

CREATE TABLE IF NOT EXISTS agent_templates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    avatar TEXT NOT NULL DEFAULT '',
    device_type TEXT NOT NULL DEFAULT 'speaker',
    module_params TEXT NOT NULL DEFAULT '{}',
    agent_config TEXT NOT NULL DEFAULT '{}',
    creator_id INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    template_id INTEGER NOT NULL REFERENCES agent_templates(id),
    name TEXT NOT NULL,
    module_params TEXT NOT NULL DEFAULT '{}',
    agent_config TEXT NOT NULL DEFAULT '{}',
    memory_data TEXT NOT NULL DEFAULT '{}',
    device_id INTEGER NULL REFERENCES devices(id),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_instances_user ON agent_instances(user_id);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id),
    agent_id INTEGER NOT NULL REFERENCES agent_instances(id),
    copilot_mode INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'open' CHECK(status IN ('open','closed')),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, created_at);

CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    agent_id INTEGER NOT NULL,
    role TEXT NOT NULL CHECK(role IN ('user','assistant')),
    content TEXT NOT NULL,
    audio_path TEXT NULL,
    emotion TEXT NULL,
    copilot_mode INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_agent
    ON chat_messages(agent_id, copilot_mode, created_at, id);
CREATE INDEX IF NOT EXISTS idx_chat_messages_session
    ON chat_messages(session_id, created_at, id);

CREATE TABLE IF NOT EXISTS compressed_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL,
    copilot_mode INTEGER NOT NULL DEFAULT 0,
    content TEXT NOT NULL,
    content_last_time INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_compressed_history_agent
    ON compressed_history(agent_id, copilot_mode, content_last_time);

CREATE TABLE IF NOT EXISTS session_analysis (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL UNIQUE,
    agent_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending','processing','completed','failed')),
    duration_secs REAL NULL,
    avg_child_utterance_len REAL NULL,
    analysis_result TEXT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS ai_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    monitor_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    session_id TEXT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    prompt_tokens INTEGER NULL,
    completion_tokens INTEGER NULL,
    input_chars INTEGER NOT NULL DEFAULT 0,
    output_chars INTEGER NOT NULL DEFAULT 0,
    tool_count INTEGER NOT NULL DEFAULT 0,
    tool_calls_made INTEGER NOT NULL DEFAULT 0,
    input_cost REAL NOT NULL DEFAULT 0,
    output_cost REAL NOT NULL DEFAULT 0,
    total_cost REAL NOT NULL DEFAULT 0,
    first_byte_ms REAL NULL,
    first_token_ms REAL NULL,
    total_time_ms REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'ok'
);
CREATE INDEX IF NOT EXISTS idx_ai_metrics_session ON ai_metrics(session_id);
CREATE INDEX IF NOT EXISTS idx_ai_metrics_time ON ai_metrics(start_time);

CREATE TABLE IF NOT EXISTS voice_clones (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'training'
        CHECK(status IN ('training','available','failed','deleted')),
    provider TEXT NOT NULL DEFAULT '',
    provider_speaker_id TEXT NULL,
    sample_path TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_voice_clones_user ON voice_clones(user_id);

CREATE TABLE IF NOT EXISTS growth_summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id INTEGER NOT NULL,
    summary_date TEXT NOT NULL,
    summary_type TEXT NOT NULL CHECK(summary_type IN ('daily','weekly')),
    content TEXT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK(status IN ('pending','completed','failed')),
    scheduled_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(agent_id, summary_date, summary_type)
);
"#;

#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
    audio_dir: PathBuf,
    /// Advisory locks serializing compaction per (agent, copilot) track.
    compaction_locks: Arc<Mutex<HashMap<(i64, bool), Arc<Mutex<()>>>>>,
}

impl Store {
    pub fn initialize(db_path: PathBuf, audio_dir: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
        std::fs::create_dir_all(&audio_dir).with_context(|| {
            format!("Failed to create audio directory: {}", audio_dir.display())
        })?;

        let conn = open_connection(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("Failed to initialize database schema")?;

        Ok(Self {
            db_path,
            audio_dir,
            compaction_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    pub(crate) async fn compaction_lock(&self, agent_id: i64, copilot_mode: bool) -> Arc<Mutex<()>> {
        let mut locks = self.compaction_locks.lock().await;
        locks
            .entry((agent_id, copilot_mode))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub(crate) async fn run_blocking<F, T>(&self, task_fn: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut conn = open_connection(&db_path)?;
            task_fn(&mut conn)
        })
        .await
        .map_err(|err| anyhow!("Storage worker failed: {err}"))?
    }
}

pub(crate) fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Unable to open SQLite database at {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(3))
        .context("Failed to configure SQLite busy timeout")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("Failed to enable SQLite WAL journal mode")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("Failed to enable SQLite foreign key constraints")?;
    Ok(conn)
}

pub(crate) fn now_unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Map store-internal anyhow errors onto the pipeline error type at the
/// trait boundary.
pub(crate) fn storage_err(err: anyhow::Error) -> kaiwa_core::Error {
    kaiwa_core::Error::Storage(err.to_string())
}

#[cfg(test)]
pub(crate) fn test_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Store::initialize(dir.path().join("kaiwa.sqlite3"), dir.path().join("audio"))
        .expect("store should initialize");
    (store, dir)
}
