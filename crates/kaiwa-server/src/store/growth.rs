//! Daily and weekly growth summaries.

use rusqlite::{params, Row};

use super::{now_unix_millis, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryType {
    Daily,
    Weekly,
}

impl SummaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GrowthRow {
    pub id: i64,
    pub agent_id: i64,
    /// ISO date (`2026-08-02`).
    pub summary_date: String,
    pub summary_type: String,
    pub content: Option<String>,
    pub status: String,
    pub scheduled_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

fn map_growth(row: &Row<'_>) -> rusqlite::Result<GrowthRow> {
    Ok(GrowthRow {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        summary_date: row.get(2)?,
        summary_type: row.get(3)?,
        content: row.get(4)?,
        status: row.get(5)?,
        scheduled_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const GROWTH_COLUMNS: &str =
    "id, agent_id, summary_date, summary_type, content, status, scheduled_at, created_at, updated_at";

impl Store {
    /// Enqueue a rollup; `(agent, date, type)` is unique so re-scheduling a
    /// day that already has a row is a no-op.
    pub async fn schedule_growth_summary(
        &self,
        agent_id: i64,
        summary_date: &str,
        summary_type: SummaryType,
        scheduled_at: i64,
    ) -> anyhow::Result<()> {
        let summary_date = summary_date.to_string();
        self.run_blocking(move |conn| {
            let now = now_unix_millis();
            conn.execute(
                "INSERT OR IGNORE INTO growth_summaries
                     (agent_id, summary_date, summary_type, status, scheduled_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)",
                params![agent_id, summary_date, summary_type.as_str(), scheduled_at, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Pending rows whose scheduled time has passed, oldest first.
    pub async fn due_growth_summaries(&self, now_ms: i64) -> anyhow::Result<Vec<GrowthRow>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GROWTH_COLUMNS} FROM growth_summaries
                 WHERE status = 'pending' AND scheduled_at <= ?1
                 ORDER BY scheduled_at ASC LIMIT 16"
            ))?;
            let rows = stmt.query_map(params![now_ms], map_growth)?;
            let mut due = Vec::new();
            for row in rows {
                due.push(row?);
            }
            Ok(due)
        })
        .await
    }

    pub async fn complete_growth_summary(&self, id: i64, content: &str) -> anyhow::Result<()> {
        let content = content.to_string();
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE growth_summaries
                 SET status = 'completed', content = ?1, updated_at = ?2 WHERE id = ?3",
                params![content, now_unix_millis(), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn fail_growth_summary(&self, id: i64) -> anyhow::Result<()> {
        self.run_blocking(move |conn| {
            conn.execute(
                "UPDATE growth_summaries SET status = 'failed', updated_at = ?1 WHERE id = ?2",
                params![now_unix_millis(), id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_growth_summaries(&self, agent_id: i64) -> anyhow::Result<Vec<GrowthRow>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {GROWTH_COLUMNS} FROM growth_summaries
                 WHERE agent_id = ?1 ORDER BY summary_date DESC"
            ))?;
            let rows = stmt.query_map(params![agent_id], map_growth)?;
            let mut summaries = Vec::new();
            for row in rows {
                summaries.push(row?);
            }
            Ok(summaries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;

    #[tokio::test]
    async fn scheduling_is_unique_per_agent_date_type() {
        let (store, _dir) = test_store();
        store
            .schedule_growth_summary(1, "2026-08-02", SummaryType::Daily, 100)
            .await
            .expect("first");
        store
            .schedule_growth_summary(1, "2026-08-02", SummaryType::Daily, 999)
            .await
            .expect("duplicate ignored");
        store
            .schedule_growth_summary(1, "2026-08-02", SummaryType::Weekly, 100)
            .await
            .expect("different type allowed");

        let due = store.due_growth_summaries(1_000).await.expect("due");
        assert_eq!(due.len(), 2);
        // The duplicate did not move the original schedule.
        assert_eq!(due[0].scheduled_at, 100);
    }

    #[tokio::test]
    async fn only_due_pending_rows_are_claimed() {
        let (store, _dir) = test_store();
        store
            .schedule_growth_summary(1, "2026-08-02", SummaryType::Daily, 100)
            .await
            .expect("due");
        store
            .schedule_growth_summary(1, "2026-08-03", SummaryType::Daily, 10_000)
            .await
            .expect("future");

        let due = store.due_growth_summaries(500).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].summary_date, "2026-08-02");

        store.complete_growth_summary(due[0].id, "今天聊了恐龙").await.expect("complete");
        assert!(store.due_growth_summaries(500).await.expect("due").is_empty());

        let all = store.list_growth_summaries(1).await.expect("list");
        assert_eq!(all.len(), 2);
        let done = all.iter().find(|r| r.status == "completed").expect("completed row");
        assert_eq!(done.content.as_deref(), Some("今天聊了恐龙"));
    }
}
