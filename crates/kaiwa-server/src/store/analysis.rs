//! Post-session analysis jobs.
//!
//! `pending → processing → completed | failed`, with bounded retries: a
//! failure under the cap re-queues the row as `pending`, the cap leaves it
//! `failed` until someone resets it by hand.

use rusqlite::{params, OptionalExtension, Row};
use serde_json::Value;

use super::{now_unix_millis, Store, ANALYSIS_MAX_RETRIES};

#[derive(Debug, Clone, serde::Serialize)]
pub struct AnalysisRow {
    pub id: i64,
    pub session_id: String,
    pub agent_id: i64,
    pub status: String,
    pub duration_secs: Option<f64>,
    pub avg_child_utterance_len: Option<f64>,
    pub analysis_result: Option<Value>,
    pub retry_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

fn map_analysis(row: &Row<'_>) -> rusqlite::Result<AnalysisRow> {
    let result: Option<String> = row.get(6)?;
    Ok(AnalysisRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_id: row.get(2)?,
        status: row.get(3)?,
        duration_secs: row.get(4)?,
        avg_child_utterance_len: row.get(5)?,
        analysis_result: result.and_then(|raw| serde_json::from_str(&raw).ok()),
        retry_count: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

const ANALYSIS_COLUMNS: &str = "id, session_id, agent_id, status, duration_secs, \
     avg_child_utterance_len, analysis_result, retry_count, created_at, updated_at";

impl Store {
    /// Queue analysis for a closed session. One row per session; repeated
    /// session closes are no-ops.
    pub async fn create_analysis_task(
        &self,
        session_id: &str,
        agent_id: i64,
    ) -> anyhow::Result<()> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let now = now_unix_millis();
            conn.execute(
                "INSERT OR IGNORE INTO session_analysis
                     (session_id, agent_id, status, retry_count, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?3)",
                params![session_id, agent_id, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Claim one pending job. The single worker still claims via a status
    /// transition so a crashed run is visible as stuck `processing`.
    pub async fn claim_analysis_task(&self) -> anyhow::Result<Option<AnalysisRow>> {
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            let row = tx
                .query_row(
                    &format!(
                        "SELECT {ANALYSIS_COLUMNS} FROM session_analysis
                         WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1"
                    ),
                    [],
                    map_analysis,
                )
                .optional()?;
            if let Some(row) = &row {
                tx.execute(
                    "UPDATE session_analysis SET status = 'processing', updated_at = ?1 WHERE id = ?2",
                    params![now_unix_millis(), row.id],
                )?;
            }
            tx.commit()?;
            Ok(row)
        })
        .await
    }

    pub async fn complete_analysis(
        &self,
        id: i64,
        duration_secs: f64,
        avg_child_utterance_len: f64,
        result: &Value,
    ) -> anyhow::Result<()> {
        let result = result.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE session_analysis
                 SET status = 'completed', duration_secs = ?1, avg_child_utterance_len = ?2,
                     analysis_result = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![duration_secs, avg_child_utterance_len, result, now_unix_millis(), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn fail_analysis(&self, id: i64) -> anyhow::Result<()> {
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE session_analysis
                 SET retry_count = retry_count + 1,
                     status = CASE WHEN retry_count + 1 >= ?1 THEN 'failed' ELSE 'pending' END,
                     updated_at = ?2
                 WHERE id = ?3",
                params![ANALYSIS_MAX_RETRIES, now_unix_millis(), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_analysis(&self, session_id: &str) -> anyhow::Result<Option<AnalysisRow>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {ANALYSIS_COLUMNS} FROM session_analysis WHERE session_id = ?1"),
                    params![session_id],
                    map_analysis,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use serde_json::json;

    #[tokio::test]
    async fn session_analysis_is_unique_per_session() {
        let (store, _dir) = test_store();
        store.create_analysis_task("S1", 1).await.expect("first");
        store.create_analysis_task("S1", 1).await.expect("duplicate is ignored");

        let claimed = store.claim_analysis_task().await.expect("claim").expect("row");
        assert_eq!(claimed.session_id, "S1");
        assert!(store.claim_analysis_task().await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn completion_writes_result() {
        let (store, _dir) = test_store();
        store.create_analysis_task("S1", 1).await.expect("create");
        let row = store.claim_analysis_task().await.expect("claim").expect("row");
        store
            .complete_analysis(row.id, 120.5, 6.2, &json!({ "mood": "开心" }))
            .await
            .expect("complete");

        let done = store.get_analysis("S1").await.expect("query").expect("row");
        assert_eq!(done.status, "completed");
        assert_eq!(done.analysis_result.expect("result")["mood"], "开心");
    }

    #[tokio::test]
    async fn failures_requeue_until_the_cap() {
        let (store, _dir) = test_store();
        store.create_analysis_task("S1", 1).await.expect("create");

        for attempt in 1..=ANALYSIS_MAX_RETRIES {
            let row = store.claim_analysis_task().await.expect("claim").expect("row");
            store.fail_analysis(row.id).await.expect("fail");
            let state = store.get_analysis("S1").await.expect("query").expect("row");
            assert_eq!(state.retry_count, attempt);
            if attempt < ANALYSIS_MAX_RETRIES {
                assert_eq!(state.status, "pending");
            } else {
                assert_eq!(state.status, "failed", "cap reached, manual reset required");
            }
        }
        assert!(store.claim_analysis_task().await.expect("claim").is_none());
    }
}
