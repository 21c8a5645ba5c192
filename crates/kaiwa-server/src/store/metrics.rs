//! `ai_metrics` sink for the metrics flusher.

use async_trait::async_trait;
use rusqlite::params;

use kaiwa_modules::{MetricRow, MetricsSink};

use super::Store;

#[async_trait]
impl MetricsSink for Store {
    async fn write_batch(&self, rows: &[MetricRow]) -> anyhow::Result<()> {
        let rows = rows.to_vec();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO ai_metrics
                         (monitor_id, provider, model, session_id, start_time, end_time,
                          prompt_tokens, completion_tokens, input_chars, output_chars,
                          tool_count, tool_calls_made, input_cost, output_cost, total_cost,
                          first_byte_ms, first_token_ms, total_time_ms, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                             ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                )?;
                for row in &rows {
                    stmt.execute(params![
                        row.monitor_id,
                        row.provider,
                        row.model,
                        row.session_id,
                        row.start_time_ms,
                        row.end_time_ms,
                        row.prompt_tokens,
                        row.completion_tokens,
                        row.input_chars,
                        row.output_chars,
                        row.tool_count,
                        row.tool_calls_made,
                        row.input_cost,
                        row.output_cost,
                        row.total_cost,
                        row.first_byte_ms,
                        row.first_token_ms,
                        row.total_time_ms,
                        row.status,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use kaiwa_modules::{MetricsRecorder, PricingTable};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn flusher_persists_rows_with_consistent_times() {
        let (store, _dir) = test_store();
        let recorder = MetricsRecorder::new(PricingTable::default(), 64);
        let handle = recorder.spawn_flusher(
            Arc::new(store.clone()),
            10,
            Duration::from_millis(20),
        );

        let mut scope = recorder.start("bailian", "qwen-plus", Some("S1".into()), 20);
        scope.mark_first_token();
        scope.finish("ok", Some(100), Some(40), 30);

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let count: i64 = store
                    .run_blocking(|conn| {
                        Ok(conn.query_row("SELECT COUNT(1) FROM ai_metrics", [], |r| r.get(0))?)
                    })
                    .await
                    .expect("count");
                if count > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("row should land in ai_metrics");

        let (start, end, prompt, completion): (i64, i64, i64, i64) = store
            .run_blocking(|conn| {
                Ok(conn.query_row(
                    "SELECT start_time, end_time, prompt_tokens, completion_tokens FROM ai_metrics",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )?)
            })
            .await
            .expect("row");
        assert!(end >= start);
        assert_eq!(prompt + completion, 140);
        handle.abort();
    }
}
