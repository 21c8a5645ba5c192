//! Growth summary scheduler and worker.
//!
//! One task does both jobs on a single cadence: enqueue today's rollup for
//! every agent at its configured `daily_summary_time` (plus a weekly rollup
//! on Sundays), then process whatever is due. Failures mark the row `failed`
//! and never propagate.

use std::time::Duration;

use chrono::{Datelike, Local, NaiveTime, TimeZone, Timelike};
use tracing::{debug, warn};

use kaiwa_core::config::AgentConfig;
use kaiwa_pipeline::Summarizer;

use crate::state::AppState;
use crate::store::{GrowthRow, SummaryType};

const TICK: Duration = Duration::from_secs(60);

pub fn spawn(
    state: AppState,
    summarizer: std::sync::Arc<dyn Summarizer>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(err) = schedule_pass(&state).await {
                warn!(error = %err, "growth summary scheduling failed");
            }
            if let Err(err) = process_pass(&state, summarizer.as_ref()).await {
                warn!(error = %err, "growth summary processing failed");
            }
            tokio::time::sleep(TICK).await;
        }
    })
}

async fn schedule_pass(state: &AppState) -> anyhow::Result<()> {
    let now = Local::now();
    let today = now.date_naive();
    let date = today.format("%Y-%m-%d").to_string();

    for agent_id in state.store.all_agent_ids().await? {
        let Some(agent) = state.store.get_agent(agent_id).await? else {
            continue;
        };
        let config = match AgentConfig::from_json(&agent.agent_config) {
            Ok(config) => config,
            Err(err) => {
                debug!(agent_id, error = %err, "skipping agent with bad config");
                continue;
            }
        };

        let at = parse_daily_time(&config.function_settings.daily_summary_time)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(20, 30, 0).expect("valid time"));
        let scheduled = Local
            .from_local_datetime(&today.and_time(at))
            .single()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or_else(|| now.timestamp_millis());

        state
            .store
            .schedule_growth_summary(agent_id, &date, SummaryType::Daily, scheduled)
            .await?;

        // Weekly rollup on Sunday evening, covering the past seven days.
        if today.weekday() == chrono::Weekday::Sun {
            state
                .store
                .schedule_growth_summary(agent_id, &date, SummaryType::Weekly, scheduled)
                .await?;
        }
    }
    Ok(())
}

async fn process_pass(state: &AppState, summarizer: &dyn Summarizer) -> anyhow::Result<()> {
    let now_ms = Local::now().timestamp_millis();
    for row in state.store.due_growth_summaries(now_ms).await? {
        if let Err(err) = process_row(state, summarizer, &row).await {
            warn!(row_id = row.id, error = %err, "growth summary failed");
            state.store.fail_growth_summary(row.id).await?;
        }
    }
    Ok(())
}

async fn process_row(
    state: &AppState,
    summarizer: &dyn Summarizer,
    row: &GrowthRow,
) -> anyhow::Result<()> {
    let (from_ms, to_ms) = summary_range(row)?;
    let messages = state
        .store
        .agent_messages_between(row.agent_id, false, from_ms, to_ms)
        .await?;

    if messages.is_empty() {
        // Nothing happened that day; complete with an empty rollup rather
        // than burning an LLM call.
        state.store.complete_growth_summary(row.id, "").await?;
        return Ok(());
    }

    let content = summarizer
        .summarize(&messages)
        .await
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    state.store.complete_growth_summary(row.id, &content).await?;
    debug!(row_id = row.id, agent_id = row.agent_id, "growth summary completed");
    Ok(())
}

fn summary_range(row: &GrowthRow) -> anyhow::Result<(i64, i64)> {
    let date = chrono::NaiveDate::parse_from_str(&row.summary_date, "%Y-%m-%d")?;
    let days_back = if row.summary_type == "weekly" { 6 } else { 0 };
    let start = date - chrono::Duration::days(days_back);
    let start_ms = Local
        .from_local_datetime(&start.and_hms_opt(0, 0, 0).expect("midnight"))
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_default();
    let end_ms = Local
        .from_local_datetime(&(date + chrono::Duration::days(1)).and_hms_opt(0, 0, 0).expect("midnight"))
        .single()
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(i64::MAX);
    Ok((start_ms, end_ms))
}

fn parse_daily_time(raw: &str) -> Option<NaiveTime> {
    let (hours, minutes) = raw.trim().split_once(':')?;
    let time = NaiveTime::from_hms_opt(hours.parse().ok()?, minutes.parse().ok()?, 0)?;
    // Guard nonsense like "99:99" sneaking through lenient parses.
    (time.hour() < 24).then_some(time)
}
