//! Barge-in intent gate.
//!
//! While the assistant is speaking, recognized user speech is classified
//! before it preempts the turn: a fast LLM call labels it `interrupt`,
//! `ignore` or `wait`. Interrupts are rate limited; `wait` inputs queue
//! (bounded, oldest dropped) and only the newest is delivered once the
//! current segment finishes. Classifier failures degrade to `wait` so a
//! flaky provider can never break barge-in into either extreme.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tracing::debug;

use kaiwa_core::config::InterruptPolicy;
use kaiwa_core::text::strip_json_fence;

use kaiwa_modules::Module;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Interrupt,
    Ignore,
    Wait,
}

/// A user input parked while the assistant finishes speaking.
#[derive(Debug, Clone)]
pub struct QueuedInput {
    pub text: String,
    pub confidence: f32,
    pub audio_path: Option<String>,
    pub emotion: String,
    pub queued_at: Instant,
}

/// Conversation context handed to the classifier.
#[derive(Debug, Clone, Default)]
pub struct SpeakingContext {
    pub user_question: String,
    pub ai_response: String,
    pub ai_current_sentence: String,
}

const CLASSIFY_SYSTEM_PROMPT: &str = "你是语音助手的打断意图分类器。孩子在助手说话时又说了一句话，\
判断这句话是想打断（interrupt）、无关噪声（ignore），还是可以等助手说完再处理（wait）。\
只输出JSON：{\"label\": \"interrupt|ignore|wait\", \"score\": 0到1}";

pub struct InterruptGate {
    policy: InterruptPolicy,
    last_interrupt: Option<Instant>,
    queue: VecDeque<QueuedInput>,
}

impl InterruptGate {
    pub fn new(policy: InterruptPolicy) -> Self {
        Self {
            policy,
            last_interrupt: None,
            queue: VecDeque::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.policy.enabled
    }

    /// Classify recognized speech heard while the assistant talks. The LLM
    /// handle is the agent's primary chat module.
    pub async fn classify(
        &self,
        llm: &Arc<dyn Module>,
        model_config: &Value,
        text: &str,
        confidence: f32,
        context: &SpeakingContext,
    ) -> Verdict {
        if confidence < self.policy.min_confidence {
            return Verdict::Ignore;
        }

        let user_prompt = format!(
            "孩子刚才的完整问题：{}\n助手正在回答：{}\n正在播的句子：{}\n孩子新说的话（置信度{:.2}）：{}",
            context.user_question, context.ai_response, context.ai_current_sentence, confidence, text
        );
        let mut args = json!({
            "messages": [
                { "role": "system", "content": CLASSIFY_SYSTEM_PROMPT },
                { "role": "user", "content": user_prompt }
            ],
            "max_tokens": 64,
            "temperature": 1.0,
        });
        if let Some(model) = model_config.get("model").and_then(Value::as_str) {
            args["model"] = json!(model);
        }

        match llm.call("chat_completion", args).await {
            Ok(result) => {
                let content = result.get("content").and_then(Value::as_str).unwrap_or("");
                parse_verdict(content)
            }
            Err(err) => {
                debug!(error = %err, "interrupt classifier failed, defaulting to wait");
                Verdict::Wait
            }
        }
    }

    /// Rate limit: an interrupt that fires too soon after the previous one is
    /// demoted to `wait`.
    pub fn try_interrupt(&mut self) -> bool {
        let allowed = match self.last_interrupt {
            Some(at) => at.elapsed().as_secs_f32() >= self.policy.min_interrupt_interval_sec,
            None => true,
        };
        if allowed {
            self.last_interrupt = Some(Instant::now());
        }
        allowed
    }

    pub fn enqueue_wait(&mut self, input: QueuedInput) {
        if self.queue.len() >= self.policy.max_queue_len {
            self.queue.pop_front();
            debug!("interrupt wait queue overflow, dropped oldest");
        }
        self.queue.push_back(input);
    }

    /// Segment finished: deliver only the newest non-expired queued input.
    pub fn drain(&mut self) -> Option<QueuedInput> {
        let timeout = self.policy.queue_timeout_sec;
        let newest = self
            .queue
            .drain(..)
            .filter(|item| item.queued_at.elapsed().as_secs_f32() <= timeout)
            .last();
        newest
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

fn parse_verdict(content: &str) -> Verdict {
    if let Ok(value) = strip_json_fence(content) {
        if let Some(label) = value.get("label").and_then(Value::as_str) {
            return label_to_verdict(label).unwrap_or(Verdict::Wait);
        }
    }
    // Model ignored the JSON instruction; scan for a bare label.
    let lowered = content.to_lowercase();
    for label in ["interrupt", "ignore", "wait"] {
        if lowered.contains(label) {
            return label_to_verdict(label).unwrap_or(Verdict::Wait);
        }
    }
    Verdict::Wait
}

fn label_to_verdict(label: &str) -> Option<Verdict> {
    match label {
        "interrupt" => Some(Verdict::Interrupt),
        "ignore" => Some(Verdict::Ignore),
        "wait" => Some(Verdict::Wait),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gate(policy: InterruptPolicy) -> InterruptGate {
        InterruptGate::new(policy)
    }

    fn queued(text: &str) -> QueuedInput {
        QueuedInput {
            text: text.to_string(),
            confidence: 1.0,
            audio_path: None,
            emotion: "neutral".to_string(),
            queued_at: Instant::now(),
        }
    }

    #[test]
    fn verdict_parses_fenced_and_bare_json() {
        assert_eq!(parse_verdict("{\"label\":\"interrupt\",\"score\":0.9}"), Verdict::Interrupt);
        assert_eq!(
            parse_verdict("```json\n{\"label\": \"ignore\", \"score\": 0.8}\n```"),
            Verdict::Ignore
        );
        assert_eq!(parse_verdict("我认为应该 wait 一下"), Verdict::Wait);
        assert_eq!(parse_verdict("???"), Verdict::Wait);
    }

    #[test]
    fn interrupts_are_rate_limited() {
        let mut gate = gate(InterruptPolicy {
            min_interrupt_interval_sec: 60.0,
            ..InterruptPolicy::default()
        });
        assert!(gate.try_interrupt());
        assert!(!gate.try_interrupt(), "second interrupt inside the window is demoted");
    }

    #[test]
    fn wait_queue_keeps_newest_within_bound() {
        let mut gate = gate(InterruptPolicy {
            max_queue_len: 2,
            ..InterruptPolicy::default()
        });
        gate.enqueue_wait(queued("一"));
        gate.enqueue_wait(queued("二"));
        gate.enqueue_wait(queued("三"));
        let delivered = gate.drain().expect("newest should survive");
        assert_eq!(delivered.text, "三");
        assert!(gate.drain().is_none(), "drain empties the queue");
    }

    #[test]
    fn expired_entries_are_not_delivered() {
        let mut gate = gate(InterruptPolicy {
            queue_timeout_sec: 0.01,
            ..InterruptPolicy::default()
        });
        let mut stale = queued("太晚了");
        stale.queued_at = Instant::now() - Duration::from_secs(5);
        gate.enqueue_wait(stale);
        assert!(gate.drain().is_none());
    }
}
