//! Per-provider-call metrics.
//!
//! Every provider call runs inside a monitor scope: the caller opens the
//! scope before dispatch, marks first-byte / first-token as the stream
//! progresses and finishes it with token counts and a status. Finished rows
//! go through a bounded in-memory queue that a background flusher drains in
//! batches; recording never blocks the caller and queue overflow drops the
//! oldest rows with a warning.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// One row of the `ai_metrics` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub monitor_id: String,
    pub provider: String,
    pub model: String,
    pub session_id: Option<String>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub input_chars: i64,
    pub output_chars: i64,
    pub tool_count: i64,
    pub tool_calls_made: i64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub first_byte_ms: Option<f64>,
    pub first_token_ms: Option<f64>,
    pub total_time_ms: f64,
    pub status: String,
}

impl MetricRow {
    pub fn total_tokens(&self) -> Option<i64> {
        Some(self.prompt_tokens? + self.completion_tokens?)
    }
}

/// Cost per 1K tokens, keyed by `(provider, model)`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Price {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: HashMap<(String, String), Price>,
}

impl PricingTable {
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut prices = HashMap::new();
        if let Some(map) = value.as_object() {
            for (provider, models) in map {
                let Some(models) = models.as_object() else { continue };
                for (model, price) in models {
                    if let Ok(price) = serde_json::from_value::<Price>(price.clone()) {
                        prices.insert((provider.clone(), model.clone()), price);
                    }
                }
            }
        }
        Self { prices }
    }

    pub fn cost(&self, provider: &str, model: &str, prompt_tokens: i64, completion_tokens: i64) -> (f64, f64) {
        match self.prices.get(&(provider.to_string(), model.to_string())) {
            Some(price) => (
                prompt_tokens as f64 / 1000.0 * price.input_per_1k,
                completion_tokens as f64 / 1000.0 * price.output_per_1k,
            ),
            None => (0.0, 0.0),
        }
    }
}

/// Persistence boundary; implemented over the `ai_metrics` table.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write_batch(&self, rows: &[MetricRow]) -> anyhow::Result<()>;
}

struct Queue {
    rows: Mutex<VecDeque<MetricRow>>,
    notify: Notify,
    capacity: usize,
}

impl Queue {
    // Plain mutex: critical sections are push/drain only and never await.
    fn push(&self, row: MetricRow) {
        {
            let mut rows = self.rows.lock().expect("metrics queue poisoned");
            if rows.len() >= self.capacity {
                rows.pop_front();
                warn!("metrics queue full, dropped oldest row");
            }
            rows.push_back(row);
        }
        self.notify.notify_one();
    }

    fn drain(&self, max: usize) -> Vec<MetricRow> {
        let mut rows = self.rows.lock().expect("metrics queue poisoned");
        let take = rows.len().min(max);
        rows.drain(..take).collect()
    }

    fn len(&self) -> usize {
        self.rows.lock().expect("metrics queue poisoned").len()
    }

    fn requeue_front(&self, batch: Vec<MetricRow>) {
        let mut rows = self.rows.lock().expect("metrics queue poisoned");
        for row in batch.into_iter().rev() {
            if rows.len() >= self.capacity {
                rows.pop_back();
            }
            rows.push_front(row);
        }
    }
}

/// Handle used by the orchestrator to open monitor scopes.
#[derive(Clone)]
pub struct MetricsRecorder {
    queue: Arc<Queue>,
    pricing: Arc<PricingTable>,
}

impl MetricsRecorder {
    pub fn new(pricing: PricingTable, capacity: usize) -> Self {
        Self {
            queue: Arc::new(Queue {
                rows: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
            pricing: Arc::new(pricing),
        }
    }

    pub fn start(
        &self,
        provider: impl Into<String>,
        model: impl Into<String>,
        session_id: Option<String>,
        input_chars: usize,
    ) -> MonitorScope {
        MonitorScope {
            monitor_id: Uuid::new_v4().to_string(),
            provider: provider.into(),
            model: model.into(),
            session_id,
            started_at: Instant::now(),
            start_time_ms: unix_millis(),
            input_chars: input_chars as i64,
            first_byte_ms: None,
            first_token_ms: None,
            tool_count: 0,
            tool_calls_made: 0,
            recorder: self.clone(),
        }
    }

    /// Spawn the background flusher. Flushes when `batch_size` rows are
    /// pending or every `interval`, whichever comes first; failed batches are
    /// re-queued at the front, bounded by the queue capacity.
    pub fn spawn_flusher(
        &self,
        sink: Arc<dyn MetricsSink>,
        batch_size: usize,
        interval: Duration,
    ) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let batch_size = batch_size.clamp(1, 100);
        tokio::spawn(async move {
            loop {
                if queue.len() < batch_size {
                    tokio::select! {
                        _ = queue.notify.notified() => {}
                        _ = tokio::time::sleep(interval) => {}
                    }
                }

                let batch = queue.drain(batch_size);
                if batch.is_empty() {
                    continue;
                }

                if let Err(err) = sink.write_batch(&batch).await {
                    warn!(error = %err, rows = batch.len(), "metrics flush failed, re-queueing");
                    queue.requeue_front(batch);
                    tokio::time::sleep(interval).await;
                } else {
                    debug!(rows = batch.len(), "metrics batch flushed");
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Accrues timing for one provider call. Finish it on every exit path; a
/// scope dropped without finishing records nothing.
pub struct MonitorScope {
    monitor_id: String,
    provider: String,
    model: String,
    session_id: Option<String>,
    started_at: Instant,
    start_time_ms: i64,
    input_chars: i64,
    first_byte_ms: Option<f64>,
    first_token_ms: Option<f64>,
    tool_count: i64,
    tool_calls_made: i64,
    recorder: MetricsRecorder,
}

impl MonitorScope {
    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    pub fn mark_first_byte(&mut self) {
        if self.first_byte_ms.is_none() {
            self.first_byte_ms = Some(elapsed_ms(self.started_at));
        }
    }

    pub fn mark_first_token(&mut self) {
        if self.first_token_ms.is_none() {
            self.first_token_ms = Some(elapsed_ms(self.started_at));
        }
    }

    pub fn set_tool_counts(&mut self, tool_count: usize, tool_calls_made: usize) {
        self.tool_count = tool_count as i64;
        self.tool_calls_made = tool_calls_made as i64;
    }

    pub fn finish(
        self,
        status: &str,
        prompt_tokens: Option<i64>,
        completion_tokens: Option<i64>,
        output_chars: usize,
    ) {
        let (input_cost, output_cost) = self.recorder.pricing.cost(
            &self.provider,
            &self.model,
            prompt_tokens.unwrap_or(0),
            completion_tokens.unwrap_or(0),
        );
        let row = MetricRow {
            monitor_id: self.monitor_id,
            provider: self.provider,
            model: self.model,
            session_id: self.session_id,
            start_time_ms: self.start_time_ms,
            end_time_ms: unix_millis(),
            prompt_tokens,
            completion_tokens,
            input_chars: self.input_chars,
            output_chars: output_chars as i64,
            tool_count: self.tool_count,
            tool_calls_made: self.tool_calls_made,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            first_byte_ms: self.first_byte_ms,
            first_token_ms: self.first_token_ms,
            total_time_ms: elapsed_ms(self.started_at),
            status: status.to_string(),
        };
        self.recorder.queue.push(row);
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
