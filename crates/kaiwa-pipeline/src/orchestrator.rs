//! Per-session single-writer actor.
//!
//! One orchestrator owns each open session. Every mutation of session state
//! flows through its command mailbox: the gateway enqueues frames and audio,
//! turn tasks post phase changes and completion events, and the actor
//! consumes them in order. Nothing else touches the state, which is what
//! makes barge-in and the at-most-one-generation rule enforceable.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use kaiwa_core::config::{AgentConfig, ListenMode, ModuleParams};
use kaiwa_core::{ClientFrame, Error, ListenState, Result, ServerFrame, TtsState};

use kaiwa_modules::{MetricsRecorder, ModuleKind, ModuleRegistry};

use crate::interrupt::{InterruptGate, QueuedInput, SpeakingContext, Verdict};
use crate::listening::{frame_packets, ListenController, Utterance};
use crate::state::Phase;
use crate::store::{ConversationStore, NewMessage, Role, StoredMessage, Summarizer};
use crate::turn::{run_turn, TurnProgress, TurnRequest, TurnSource};

/// How long a detached session lingers waiting for the client to reconnect
/// with the same ids before it tears down.
const RESUME_WINDOW: Duration = Duration::from_secs(30);

/// Everything the gateway ships to the client.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    Audio(Vec<u8>),
    Close { reason: String },
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

pub(crate) fn send_frame(out: &OutboundSender, frame: ServerFrame) {
    // A dead socket is not an error here; the actor lingers for resume.
    let _ = out.send(Outbound::Frame(frame));
}

#[derive(Debug)]
pub enum SessionCommand {
    Frame(ClientFrame),
    Audio(Vec<u8>),
    /// A reconnecting client attached a fresh socket.
    AttachOutput(OutboundSender),
    /// The transport is gone; linger for resume, then tear down.
    Detach,
    /// Tear down now (server shutdown, session deleted). The actor holds a
    /// sender to its own mailbox for turn events, so closure must be explicit
    /// rather than waiting for every sender to drop.
    Close,
    Turn(TurnEvent),
}

#[derive(Debug)]
pub enum TurnEvent {
    Phase { turn_id: u64, phase: Phase },
    Finished { turn_id: u64, outcome: TurnOutcome },
    InterruptVerdict {
        text: String,
        confidence: f32,
        audio_path: Option<String>,
        verdict: Verdict,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Empty,
    Failed,
}

/// Per-phase deadlines (§ timeouts are config-surface, not hardcoded at call
/// sites).
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub hello: Duration,
    pub asr_final: Duration,
    pub llm_first_token: Duration,
    pub llm_total: Duration,
    pub tts_first_byte: Duration,
    pub tts_sentence: Duration,
    pub cancel_drain: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            hello: Duration::from_secs(5),
            asr_final: Duration::from_secs(10),
            llm_first_token: Duration::from_secs(15),
            llm_total: Duration::from_secs(60),
            tts_first_byte: Duration::from_secs(5),
            tts_sentence: Duration::from_secs(30),
            cancel_drain: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub user_id: i64,
    pub agent_id: i64,
    pub copilot_mode: bool,
    pub config: AgentConfig,
    pub module_params: ModuleParams,
}

/// Shared dependencies handed to spawned turn tasks.
#[derive(Clone)]
pub(crate) struct TurnDeps {
    pub ctx: SessionContext,
    pub registry: Arc<ModuleRegistry>,
    pub store: Arc<dyn ConversationStore>,
    pub metrics: MetricsRecorder,
    pub summarizer: Arc<dyn Summarizer>,
    pub out: OutboundSender,
    pub events: mpsc::UnboundedSender<SessionCommand>,
    pub timeouts: Timeouts,
}

impl TurnDeps {
    /// Map a requested voice to a provider voice id, consulting the memory
    /// preference when nothing is requested and remembering explicit
    /// switches.
    pub(crate) async fn resolve_voice(&self, requested: Option<&str>) -> String {
        let original = self.ctx.config.profile.character.voice_name.clone();
        let name = match requested {
            Some("original") | Some("current") => None,
            Some(name) => {
                self.remember_voice(name).await;
                Some(name.to_string())
            }
            None => self.memory_voice_preference().await,
        };
        let Some(name) = name else {
            return original;
        };
        clone_voice_ids(&self.ctx.config)
            .get(&name)
            .cloned()
            .unwrap_or(original)
    }

    async fn memory_voice_preference(&self) -> Option<String> {
        let memory = self
            .registry
            .resolve(ModuleKind::Memory, &self.ctx.module_params)
            .await
            .ok()?;
        let value = memory
            .call(
                "get",
                json!({ "agent_id": self.ctx.agent_id, "path": "preferences.current_voice" }),
            )
            .await
            .ok()?;
        value.as_str().map(str::to_string)
    }

    async fn remember_voice(&self, name: &str) {
        let known = clone_voice_ids(&self.ctx.config);
        if !known.contains_key(name) {
            return;
        }
        if let Ok(memory) = self
            .registry
            .resolve(ModuleKind::Memory, &self.ctx.module_params)
            .await
        {
            let _ = memory
                .call(
                    "set",
                    json!({
                        "agent_id": self.ctx.agent_id,
                        "path": "preferences.current_voice",
                        "value": name,
                    }),
                )
                .await;
        }
    }
}

fn clone_voice_ids(config: &AgentConfig) -> std::collections::BTreeMap<String, String> {
    let mut out = std::collections::BTreeMap::new();
    if let Some(ids) = config
        .extra
        .get("clone_voice")
        .and_then(|v| v.get("_voice_ids"))
        .and_then(Value::as_object)
    {
        for (name, id) in ids {
            if let Some(id) = id.as_str() {
                out.insert(name.clone(), id.to_string());
            }
        }
    }
    out
}

/// Summarizes raw history through the agent's LLM for compaction and the
/// background rollup workers.
pub struct LlmSummarizer {
    registry: Arc<ModuleRegistry>,
    params: ModuleParams,
}

impl LlmSummarizer {
    pub fn new(registry: Arc<ModuleRegistry>, params: ModuleParams) -> Self {
        Self { registry, params }
    }
}

#[async_trait::async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, messages: &[StoredMessage]) -> Result<String> {
        let llm = self.registry.resolve(ModuleKind::Llm, &self.params).await?;
        let transcript = messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let result = llm
            .call(
                "chat_completion",
                json!({
                    "messages": [
                        { "role": "system", "content": "把下面的对话压缩成一段简洁的中文摘要，\
保留孩子的喜好、约定和重要事实，不要添加评论。" },
                        { "role": "user", "content": transcript }
                    ],
                    "max_tokens": 2000,
                    "temperature": 1.0,
                }),
            )
            .await?;
        let summary = result
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if summary.is_empty() {
            return Err(Error::Internal("summarizer returned empty content".to_string()));
        }
        Ok(summary)
    }
}

struct ActiveTurn {
    turn_id: u64,
    handle: tokio::task::JoinHandle<()>,
    progress: Arc<TurnProgress>,
}

pub struct Orchestrator {
    deps: TurnDeps,
    phase: Phase,
    turn_seq: u64,
    active: Option<ActiveTurn>,
    /// Capacity-1 queue behind the current turn; newer input replaces older.
    pending: Option<TurnRequest>,
    listen: ListenController,
    gate: InterruptGate,
    last_user_text: String,
    last_input: Instant,
    detached_at: Option<Instant>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: SessionContext,
        registry: Arc<ModuleRegistry>,
        store: Arc<dyn ConversationStore>,
        metrics: MetricsRecorder,
        out: OutboundSender,
        events: mpsc::UnboundedSender<SessionCommand>,
        timeouts: Timeouts,
    ) -> Self {
        let listen = ListenController::new(&ctx.config.audio_settings, 60);
        let gate = InterruptGate::new(ctx.config.function_settings.interrupt_policy.clone());
        let summarizer = Arc::new(LlmSummarizer::new(registry.clone(), ctx.module_params.clone()));
        Self {
            deps: TurnDeps {
                ctx,
                registry,
                store,
                metrics,
                summarizer,
                out,
                events,
                timeouts,
            },
            phase: Phase::Idle,
            turn_seq: 0,
            active: None,
            pending: None,
            listen,
            gate,
            last_user_text: String::new(),
            last_input: Instant::now(),
            detached_at: None,
        }
    }

    /// Spawn the actor; returns its mailbox sender.
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<SessionCommand>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        self.seed_memory().await;

        if self.deps.ctx.config.function_settings.enable_opening_say_hello
            && !self.deps.ctx.copilot_mode
        {
            self.start_turn(TurnRequest::opening());
        }

        loop {
            let deadline = self.next_deadline();
            let command = tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if self.deadline_expired() {
                        break;
                    }
                    continue;
                }
            };

            match command {
                SessionCommand::Frame(frame) => self.handle_frame(frame).await,
                SessionCommand::Audio(packet) => self.handle_audio(packet).await,
                SessionCommand::AttachOutput(out) => {
                    info!(session = %self.deps.ctx.session_id, "socket re-attached");
                    self.deps.out = out;
                    self.detached_at = None;
                    self.last_input = Instant::now();
                }
                SessionCommand::Detach => {
                    debug!(session = %self.deps.ctx.session_id, "socket detached");
                    self.detached_at = Some(Instant::now());
                }
                SessionCommand::Close => break,
                SessionCommand::Turn(event) => self.handle_turn_event(event).await,
            }

            if self.phase == Phase::Closed {
                break;
            }
        }

        self.teardown().await;
    }

    fn next_deadline(&self) -> Instant {
        let idle_limit = Duration::from_secs_f32(
            self.deps
                .ctx
                .config
                .audio_settings
                .close_connection_no_voice_time
                .max(1.0),
        );
        let idle_at = self.last_input + idle_limit;
        match self.detached_at {
            Some(at) => idle_at.min(at + RESUME_WINDOW),
            None => idle_at,
        }
    }

    fn deadline_expired(&mut self) -> bool {
        if let Some(at) = self.detached_at {
            if at.elapsed() >= RESUME_WINDOW {
                info!(session = %self.deps.ctx.session_id, "resume window elapsed, closing session");
                return true;
            }
        }
        let idle_limit = Duration::from_secs_f32(
            self.deps
                .ctx
                .config
                .audio_settings
                .close_connection_no_voice_time
                .max(1.0),
        );
        if self.last_input.elapsed() >= idle_limit && !self.phase.is_busy() {
            info!(session = %self.deps.ctx.session_id, "idle timeout, closing connection");
            let _ = self.deps.out.send(Outbound::Close {
                reason: "no_voice_timeout".to_string(),
            });
            return true;
        }
        false
    }

    async fn handle_frame(&mut self, frame: ClientFrame) {
        match frame {
            // The gateway completes the hello exchange before the actor ever
            // sees frames; a duplicate is harmless.
            ClientFrame::Hello { .. } => {}
            ClientFrame::Text { content, .. } => {
                self.last_input = Instant::now();
                self.handle_user_text(content).await;
            }
            ClientFrame::Listen { state, mode, text, .. } => {
                self.last_input = Instant::now();
                self.handle_listen(state, mode, text).await;
            }
            ClientFrame::Abort { reason, .. } => {
                debug!(session = %self.deps.ctx.session_id, ?reason, "abort frame");
                self.pending = None;
                self.gate.clear();
                if self.phase.is_busy() || self.phase == Phase::Listening {
                    self.cancel_active(true).await;
                    self.phase = Phase::Idle;
                }
                // Abort when already idle is a no-op.
            }
            ClientFrame::Mcp { payload, .. } => {
                // Opaque tool-call envelope; forwarded to client tooling, not
                // interpreted here.
                debug!(session = %self.deps.ctx.session_id, ?payload, "mcp frame passed through");
            }
        }
    }

    async fn handle_user_text(&mut self, content: String) {
        let content = content.trim().to_string();
        if content.is_empty() {
            return;
        }
        self.last_user_text = content.clone();
        let request = TurnRequest::text(content);

        match self.phase {
            Phase::Idle | Phase::Listening => {
                self.start_turn(request);
            }
            Phase::Generating | Phase::Speaking => {
                // Client text always preempts; only recognized speech goes
                // through the intent gate.
                self.cancel_active(true).await;
                self.start_turn(request);
            }
            Phase::Transcribing | Phase::Cancelling => self.enqueue_pending(request),
            Phase::Closed => {}
        }
    }

    async fn handle_listen(
        &mut self,
        state: ListenState,
        mode: Option<ListenMode>,
        text: Option<String>,
    ) {
        match state {
            ListenState::Start => {
                if self.phase.is_speaking() {
                    // Push-to-talk while the assistant speaks is an explicit
                    // barge-in.
                    self.cancel_active(true).await;
                    self.phase = Phase::Idle;
                }
                self.listen.start(mode);
                if self.phase == Phase::Idle {
                    self.phase = Phase::Listening;
                }
            }
            ListenState::Stop => {
                if let Some(utterance) = self.listen.stop() {
                    self.on_utterance(utterance).await;
                } else if self.phase == Phase::Listening {
                    self.phase = Phase::Idle;
                }
                // listen:stop outside LISTENING is a no-op.
            }
            ListenState::Detect => {
                debug!(session = %self.deps.ctx.session_id, ?text, "wake word detected");
            }
        }
    }

    async fn handle_audio(&mut self, packet: Vec<u8>) {
        self.last_input = Instant::now();
        if self.phase == Phase::Idle && self.listen.mode() != ListenMode::Manual {
            self.phase = Phase::Listening;
        }

        let probability = if self.listen.mode() == ListenMode::Manual {
            0.0
        } else {
            self.vad_probability(&packet).await
        };

        if let Some(utterance) = self.listen.push_frame(packet, probability) {
            self.on_utterance(utterance).await;
        }
    }

    async fn vad_probability(&self, packet: &[u8]) -> f32 {
        let vad = match self
            .deps
            .registry
            .resolve(ModuleKind::Vad, &self.deps.ctx.module_params)
            .await
        {
            Ok(vad) => vad,
            // Without a VAD module every frame counts as speech; manual
            // segmentation still works.
            Err(_) => return 1.0,
        };
        let args = json!({
            "session_id": self.deps.ctx.session_id,
            "frame": base64::engine::general_purpose::STANDARD.encode(packet),
        });
        match vad.call("detect", args).await {
            Ok(value) => value
                .get("probability")
                .and_then(Value::as_f64)
                .map(|p| p as f32)
                .unwrap_or(1.0),
            Err(err) => {
                debug!(error = %err, "vad detect failed, assuming speech");
                1.0
            }
        }
    }

    async fn on_utterance(&mut self, utterance: Utterance) {
        if utterance.forced {
            debug!(
                session = %self.deps.ctx.session_id,
                secs = utterance.duration_secs,
                "utterance force-cut at max duration"
            );
        }

        match self.phase {
            Phase::Idle | Phase::Listening => {
                self.start_turn(TurnRequest::voice(utterance.packets, utterance.duration_secs));
            }
            Phase::Generating | Phase::Speaking => {
                if self.gate.enabled() {
                    self.spawn_interrupt_classification(utterance);
                } else {
                    self.cancel_active(true).await;
                    self.start_turn(TurnRequest::voice(
                        utterance.packets,
                        utterance.duration_secs,
                    ));
                }
            }
            Phase::Transcribing | Phase::Cancelling => {
                self.enqueue_pending(TurnRequest::voice(
                    utterance.packets,
                    utterance.duration_secs,
                ));
            }
            Phase::Closed => {}
        }
    }

    /// Transcribe and classify speech heard while the assistant talks, off
    /// the actor loop. The verdict comes back as a command.
    fn spawn_interrupt_classification(&self, utterance: Utterance) {
        let deps = self.deps.clone();
        let context = SpeakingContext {
            user_question: self.last_user_text.clone(),
            ai_response: self
                .active
                .as_ref()
                .map(|a| a.progress.emitted_text())
                .unwrap_or_default(),
            ai_current_sentence: self
                .active
                .as_ref()
                .and_then(|a| a.progress.last_sentence())
                .unwrap_or_default(),
        };
        let policy = self.deps.ctx.config.function_settings.interrupt_policy.clone();

        tokio::spawn(async move {
            let framed = frame_packets(&utterance.packets);
            let audio_path = deps
                .store
                .save_user_audio(&deps.ctx.session_id, &framed)
                .await
                .ok();

            let asr = match deps.registry.resolve(ModuleKind::Asr, &deps.ctx.module_params).await {
                Ok(asr) => asr,
                Err(err) => {
                    debug!(error = %err, "asr unavailable for interrupt classification");
                    return;
                }
            };
            let transcript = asr
                .call(
                    "transcribe",
                    json!({
                        "audio": base64::engine::general_purpose::STANDARD.encode(&framed),
                        "language": deps.ctx.config.audio_settings.language,
                        "baby_talk": deps.ctx.config.audio_settings.enable_baby_talk_mode,
                        "format": "opus",
                    }),
                )
                .await;
            let (text, confidence) = match transcript {
                Ok(payload) => (
                    payload.get("text").and_then(Value::as_str).unwrap_or_default().trim().to_string(),
                    payload.get("confidence").and_then(Value::as_f64).unwrap_or(1.0) as f32,
                ),
                Err(err) => {
                    debug!(error = %err, "interrupt transcription failed");
                    return;
                }
            };
            if text.is_empty() {
                return;
            }

            let verdict = match deps.registry.resolve(ModuleKind::Llm, &deps.ctx.module_params).await {
                Ok(llm) => {
                    let gate = InterruptGate::new(policy);
                    let model_config = ModuleRegistry::selection_config(
                        &deps.ctx.module_params,
                        ModuleKind::Llm,
                    );
                    gate.classify(&llm, &model_config, &text, confidence, &context).await
                }
                Err(_) => Verdict::Wait,
            };

            let _ = deps.events.send(SessionCommand::Turn(TurnEvent::InterruptVerdict {
                text,
                confidence,
                audio_path,
                verdict,
            }));
        });
    }

    async fn handle_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Phase { turn_id, phase } => {
                // Late events from cancelled turns are discarded by id.
                if self.active.as_ref().map(|a| a.turn_id) == Some(turn_id) {
                    self.phase = phase;
                }
            }
            TurnEvent::Finished { turn_id, outcome } => {
                if self.active.as_ref().map(|a| a.turn_id) != Some(turn_id) {
                    return;
                }
                self.active = None;
                self.phase = Phase::Idle;
                debug!(session = %self.deps.ctx.session_id, turn_id, ?outcome, "turn finished");

                if let Some(request) = self.pending.take() {
                    self.start_turn(request);
                } else if let Some(queued) = self.gate.drain() {
                    self.start_queued(queued);
                }
            }
            TurnEvent::InterruptVerdict { text, confidence, audio_path, verdict } => {
                if !self.phase.is_speaking() {
                    // Assistant already finished; treat the speech as normal
                    // input for the next turn.
                    self.last_user_text = text.clone();
                    self.start_or_queue(transcribed_request(text, confidence, audio_path));
                    return;
                }
                match verdict {
                    Verdict::Interrupt => {
                        if self.gate.try_interrupt() {
                            self.last_user_text = text.clone();
                            self.cancel_active(true).await;
                            self.start_turn(transcribed_request(text, confidence, audio_path));
                        } else {
                            self.gate.enqueue_wait(QueuedInput {
                                text,
                                confidence,
                                audio_path,
                                emotion: "neutral".to_string(),
                                queued_at: std::time::Instant::now(),
                            });
                        }
                    }
                    Verdict::Ignore => {
                        debug!(session = %self.deps.ctx.session_id, "speech ignored during playback");
                    }
                    Verdict::Wait => {
                        self.gate.enqueue_wait(QueuedInput {
                            text,
                            confidence,
                            audio_path,
                            emotion: "neutral".to_string(),
                            queued_at: std::time::Instant::now(),
                        });
                    }
                }
            }
        }
    }

    fn start_or_queue(&mut self, request: TurnRequest) {
        if self.phase.accepts_new_turn() {
            self.start_turn(request);
        } else {
            self.enqueue_pending(request);
        }
    }

    fn start_queued(&mut self, queued: QueuedInput) {
        self.last_user_text = queued.text.clone();
        let mut request = transcribed_request(queued.text, queued.confidence, queued.audio_path);
        request.emotion = queued.emotion;
        self.start_turn(request);
    }

    /// Collapse-to-latest queueing behind the current turn. The displaced
    /// input is acknowledged with a single non-fatal error frame.
    fn enqueue_pending(&mut self, request: TurnRequest) {
        if self.pending.is_some() {
            send_frame(
                &self.deps.out,
                ServerFrame::Error {
                    code: 429,
                    message: "session busy, earlier input dropped".to_string(),
                    details: Some(json!({ "kind": "busy_dropped" })),
                },
            );
        }
        self.pending = Some(request);
    }

    fn start_turn(&mut self, request: TurnRequest) {
        debug_assert!(self.active.is_none(), "at most one turn in flight");
        self.turn_seq += 1;
        let turn_id = self.turn_seq;
        let progress = Arc::new(TurnProgress::default());

        self.phase = match request.source {
            TurnSource::Voice { .. } => Phase::Transcribing,
            _ => Phase::Generating,
        };

        let handle = tokio::spawn(run_turn(
            self.deps.clone(),
            turn_id,
            request,
            progress.clone(),
        ));
        self.active = Some(ActiveTurn { turn_id, handle, progress });
    }

    /// Barge-in/cancellation: stop audio immediately, abort the turn task,
    /// wait out the drain deadline and persist any truncated content.
    async fn cancel_active(&mut self, truncated: bool) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.phase = Phase::Cancelling;
        send_frame(&self.deps.out, ServerFrame::tts(TtsState::Stop));

        active.handle.abort();
        let drain = self.deps.timeouts.cancel_drain;
        let drained = tokio::time::timeout(drain, async {
            loop {
                if active.handle.is_finished() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            // Provider call did not honour cancellation inside the deadline;
            // its late result is dropped by the turn-id check.
            warn!(session = %self.deps.ctx.session_id, "cancel drain deadline exceeded");
        }

        if truncated {
            let partial = active.progress.emitted_text();
            if !partial.is_empty() {
                let result = self
                    .deps
                    .store
                    .append_message(NewMessage {
                        session_id: self.deps.ctx.session_id.clone(),
                        agent_id: self.deps.ctx.agent_id,
                        role: Role::Assistant,
                        content: partial,
                        audio_path: None,
                        emotion: Some("truncated".to_string()),
                        copilot_mode: self.deps.ctx.copilot_mode,
                    })
                    .await;
                if let Err(err) = result {
                    warn!(error = %err, "failed to persist truncated assistant message");
                }
            }
        }
        self.phase = Phase::Idle;
    }

    async fn seed_memory(&self) {
        let Ok(memory) = self
            .deps
            .registry
            .resolve(ModuleKind::Memory, &self.deps.ctx.module_params)
            .await
        else {
            return;
        };
        match self.deps.store.load_memory(self.deps.ctx.agent_id).await {
            Ok(data) => {
                let _ = memory
                    .call("import", json!({ "agent_id": self.deps.ctx.agent_id, "data": data }))
                    .await;
            }
            Err(err) => warn!(error = %err, "failed to load agent memory"),
        }
    }

    async fn teardown(&mut self) {
        self.cancel_active(true).await;
        self.phase = Phase::Closed;

        // Export memory back to the store.
        if let Ok(memory) = self
            .deps
            .registry
            .resolve(ModuleKind::Memory, &self.deps.ctx.module_params)
            .await
        {
            if let Ok(data) = memory
                .call("get", json!({ "agent_id": self.deps.ctx.agent_id }))
                .await
            {
                if let Err(err) = self
                    .deps
                    .store
                    .save_memory(self.deps.ctx.agent_id, &data)
                    .await
                {
                    warn!(error = %err, "failed to persist agent memory");
                }
            }
        }

        if !self.deps.ctx.copilot_mode {
            if let Err(err) = self
                .deps
                .store
                .enqueue_session_analysis(&self.deps.ctx.session_id, self.deps.ctx.agent_id)
                .await
            {
                warn!(error = %err, "failed to enqueue session analysis");
            }
        }

        info!(session = %self.deps.ctx.session_id, "session closed");
    }
}

fn transcribed_request(text: String, confidence: f32, audio_path: Option<String>) -> TurnRequest {
    TurnRequest {
        source: TurnSource::Transcribed,
        text: Some(text),
        emotion: "neutral".to_string(),
        confidence,
        audio_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CompressedEntry, RecentWindow};
    use async_trait::async_trait;
    use kaiwa_modules::{
        ChunkStream, Module, ModuleCatalog, ModuleFactory, PricingTable, ToolSpec,
    };
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug)]
    struct ScriptedLlm {
        sentences: Vec<String>,
        delay_ms: u64,
    }

    #[async_trait]
    impl Module for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted_llm"
        }
        fn description(&self) -> &str {
            "scripted deltas for tests"
        }
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        fn tools(&self) -> Vec<ToolSpec> {
            vec![]
        }
        async fn call(&self, _tool: &str, _args: Value) -> Result<Value> {
            Ok(json!({ "content": "{\"label\":\"interrupt\",\"score\":0.9}" }))
        }
        async fn call_stream(&self, _tool: &str, _args: Value) -> Result<ChunkStream> {
            let (tx, stream) = ChunkStream::channel(8);
            let sentences = self.sentences.clone();
            let delay = self.delay_ms;
            tokio::spawn(async move {
                let mut content = String::new();
                for (i, sentence) in sentences.iter().enumerate() {
                    if i > 0 && delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    content.push_str(sentence);
                    if !tx.delta(sentence.clone()).await {
                        return;
                    }
                }
                let _ = tx
                    .done(json!({
                        "content": content,
                        "usage": { "prompt_tokens": 12, "completion_tokens": 8 }
                    }))
                    .await;
            });
            Ok(stream)
        }
    }

    struct ScriptedLlmFactory;

    impl ModuleFactory for ScriptedLlmFactory {
        fn create(&self, config: Value) -> Result<Arc<dyn Module>> {
            let sentences = config
                .get("sentences")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_else(|| vec!["你好呀！".to_string()]);
            let delay_ms = config.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
            Ok(Arc::new(ScriptedLlm { sentences, delay_ms }))
        }
    }

    #[derive(Debug)]
    struct ScriptedTts;

    #[async_trait]
    impl Module for ScriptedTts {
        fn name(&self) -> &str {
            "scripted_tts"
        }
        fn description(&self) -> &str {
            "two packets per sentence"
        }
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        fn tools(&self) -> Vec<ToolSpec> {
            vec![]
        }
        async fn call(&self, _tool: &str, _args: Value) -> Result<Value> {
            Ok(json!({ "audio": "" }))
        }
        async fn call_stream(&self, _tool: &str, _args: Value) -> Result<ChunkStream> {
            let (tx, stream) = ChunkStream::channel(8);
            tokio::spawn(async move {
                for _ in 0..2 {
                    if !tx.audio(vec![0u8; 40]).await {
                        return;
                    }
                }
                let _ = tx.done(json!({ "packets": 2 })).await;
            });
            Ok(stream)
        }
    }

    struct ScriptedTtsFactory;

    impl ModuleFactory for ScriptedTtsFactory {
        fn create(&self, _config: Value) -> Result<Arc<dyn Module>> {
            Ok(Arc::new(ScriptedTts))
        }
    }

    #[derive(Debug)]
    struct ScriptedAsr {
        text: String,
        delay_ms: u64,
    }

    #[async_trait]
    impl Module for ScriptedAsr {
        fn name(&self) -> &str {
            "scripted_asr"
        }
        fn description(&self) -> &str {
            "fixed transcript"
        }
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        fn tools(&self) -> Vec<ToolSpec> {
            vec![]
        }
        async fn call(&self, _tool: &str, _args: Value) -> Result<Value> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(json!({ "text": self.text, "confidence": 0.95 }))
        }
    }

    struct ScriptedAsrFactory;

    impl ModuleFactory for ScriptedAsrFactory {
        fn create(&self, config: Value) -> Result<Arc<dyn Module>> {
            Ok(Arc::new(ScriptedAsr {
                text: config
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("你好")
                    .to_string(),
                delay_ms: config.get("delay_ms").and_then(Value::as_u64).unwrap_or(0),
            }))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        messages: StdMutex<Vec<StoredMessage>>,
        next_id: StdMutex<i64>,
        memory: StdMutex<Value>,
        analyses: StdMutex<Vec<String>>,
    }

    impl MemoryStore {
        fn messages(&self) -> Vec<StoredMessage> {
            self.messages.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl ConversationStore for MemoryStore {
        async fn append_message(&self, message: NewMessage) -> Result<i64> {
            let mut next_id = self.next_id.lock().expect("lock");
            *next_id += 1;
            let id = *next_id;
            self.messages.lock().expect("lock").push(StoredMessage {
                id,
                session_id: message.session_id,
                agent_id: message.agent_id,
                role: message.role,
                content: message.content,
                audio_path: message.audio_path,
                emotion: message.emotion,
                copilot_mode: message.copilot_mode,
                created_at_ms: id,
            });
            Ok(id)
        }

        async fn recent_window(
            &self,
            agent_id: i64,
            copilot_mode: bool,
            limit: usize,
        ) -> Result<RecentWindow> {
            let messages: Vec<StoredMessage> = self
                .messages
                .lock()
                .expect("lock")
                .iter()
                .filter(|m| m.agent_id == agent_id && m.copilot_mode == copilot_mode)
                .cloned()
                .collect();
            let start = messages.len().saturating_sub(limit);
            Ok(RecentWindow {
                compressed: None::<CompressedEntry>,
                messages: messages[start..].to_vec(),
            })
        }

        async fn compact_if_needed(
            &self,
            _agent_id: i64,
            _copilot_mode: bool,
            _summarizer: &dyn Summarizer,
        ) -> Result<bool> {
            Ok(false)
        }

        async fn save_user_audio(&self, session_id: &str, _opus: &[u8]) -> Result<String> {
            Ok(format!("audio/{session_id}.opus"))
        }

        async fn load_memory(&self, _agent_id: i64) -> Result<Value> {
            Ok(self.memory.lock().expect("lock").clone())
        }

        async fn save_memory(&self, _agent_id: i64, data: &Value) -> Result<()> {
            *self.memory.lock().expect("lock") = data.clone();
            Ok(())
        }

        async fn enqueue_session_analysis(&self, session_id: &str, _agent_id: i64) -> Result<()> {
            self.analyses
                .lock()
                .expect("lock")
                .push(session_id.to_string());
            Ok(())
        }
    }

    async fn build_registry(llm_config: Value, asr_config: Value) -> Arc<ModuleRegistry> {
        let mut registry = ModuleRegistry::new();
        registry.register_factory(ModuleKind::Llm, "scripted", Box::new(ScriptedLlmFactory));
        registry.register_factory(ModuleKind::Tts, "scripted", Box::new(ScriptedTtsFactory));
        registry.register_factory(ModuleKind::Asr, "scripted", Box::new(ScriptedAsrFactory));
        registry.register_factory(
            ModuleKind::Memory,
            "agent_memory",
            Box::new(kaiwa_modules::providers::AgentMemoryFactory),
        );

        let catalog: ModuleCatalog = serde_json::from_value(json!({
            "services": [
                { "kind": "llm", "code": "scripted", "is_default": true, "config": llm_config },
                { "kind": "tts", "code": "scripted", "is_default": true },
                { "kind": "asr", "code": "scripted", "is_default": true, "config": asr_config },
                { "kind": "memory", "code": "agent_memory", "is_default": true }
            ]
        }))
        .expect("catalog");
        registry.load(&catalog).await.expect("load");
        registry.init_all().await;
        Arc::new(registry)
    }

    struct Harness {
        cmd_tx: mpsc::UnboundedSender<SessionCommand>,
        out_rx: mpsc::UnboundedReceiver<Outbound>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        async fn next_outbound(&mut self) -> Outbound {
            tokio::time::timeout(Duration::from_secs(5), self.out_rx.recv())
                .await
                .expect("outbound within deadline")
                .expect("channel open")
        }

        async fn collect_until_finished(&mut self) -> Vec<Outbound> {
            let mut seen = Vec::new();
            loop {
                let item = self.next_outbound().await;
                let finished = matches!(
                    &item,
                    Outbound::Frame(ServerFrame::Llm { finished: true, .. })
                );
                seen.push(item);
                if finished {
                    return seen;
                }
            }
        }

        async fn wait_for_messages(&self, count: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.store.messages().len() < count {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("messages should be persisted");
        }
    }

    async fn start_session(llm_config: Value, asr_config: Value, config: AgentConfig) -> Harness {
        let registry = build_registry(llm_config, asr_config).await;
        let store = Arc::new(MemoryStore::default());
        let metrics = MetricsRecorder::new(PricingTable::default(), 256);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let ctx = SessionContext {
            session_id: "S1".to_string(),
            user_id: 1,
            agent_id: 1,
            copilot_mode: false,
            config,
            module_params: ModuleParams::default(),
        };
        let actor = Orchestrator::new(
            ctx,
            registry,
            store.clone(),
            metrics,
            out_tx,
            cmd_tx.clone(),
            Timeouts::default(),
        );
        let _ = actor.spawn(cmd_rx);

        Harness { cmd_tx, out_rx, store }
    }

    fn text_frame(content: &str) -> SessionCommand {
        SessionCommand::Frame(ClientFrame::Text {
            content: content.to_string(),
            agent_id: 1,
            session_id: Some("S1".to_string()),
        })
    }

    #[tokio::test]
    async fn text_turn_streams_sentences_then_audio_then_finished() {
        let mut harness = start_session(
            json!({ "sentences": ["你好呀！", "我们一起玩吧。"] }),
            json!({}),
            AgentConfig::default(),
        )
        .await;

        harness.cmd_tx.send(text_frame("你好")).expect("send");
        let outbound = harness.collect_until_finished().await;

        let mut llm_content = String::new();
        let mut audio_frames = 0;
        let mut tts_starts = 0;
        let mut tts_stops = 0;
        let mut sentence_starts = Vec::new();
        for item in &outbound {
            match item {
                Outbound::Frame(ServerFrame::Llm { content: Some(c), .. }) => {
                    llm_content.push_str(c)
                }
                Outbound::Frame(ServerFrame::Tts { state: TtsState::Start, .. }) => tts_starts += 1,
                Outbound::Frame(ServerFrame::Tts { state: TtsState::Stop, .. }) => tts_stops += 1,
                Outbound::Frame(ServerFrame::Tts {
                    state: TtsState::SentenceStart,
                    text: Some(text),
                }) => sentence_starts.push(text.clone()),
                Outbound::Audio(_) => audio_frames += 1,
                _ => {}
            }
        }
        assert_eq!(llm_content, "你好呀！我们一起玩吧。");
        assert_eq!(tts_starts, 2, "one tts:start per sentence");
        assert_eq!(tts_stops, 2);
        assert_eq!(sentence_starts, vec!["你好呀！", "我们一起玩吧。"]);
        assert_eq!(audio_frames, 4);

        harness.wait_for_messages(2).await;
        let messages = harness.store.messages();
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "你好");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "你好呀！我们一起玩吧。");
    }

    #[tokio::test]
    async fn empty_llm_output_still_finishes() {
        let mut harness = start_session(
            json!({ "sentences": [] }),
            json!({}),
            AgentConfig::default(),
        )
        .await;

        harness.cmd_tx.send(text_frame("在吗")).expect("send");
        let outbound = harness.collect_until_finished().await;

        let audio = outbound.iter().any(|o| matches!(o, Outbound::Audio(_)));
        assert!(!audio, "no audio for empty output");

        harness.wait_for_messages(2).await;
        let messages = harness.store.messages();
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "");
    }

    #[tokio::test]
    async fn text_barge_in_stops_tts_and_persists_truncated() {
        let mut harness = start_session(
            json!({ "sentences": ["第一句说完了。", "第二句还在路上。"], "delay_ms": 1500 }),
            json!({}),
            AgentConfig::default(),
        )
        .await;

        harness.cmd_tx.send(text_frame("讲个故事")).expect("send");

        // Wait until the first sentence is audibly playing.
        loop {
            if matches!(harness.next_outbound().await, Outbound::Audio(_)) {
                break;
            }
        }

        harness.cmd_tx.send(text_frame("停")).expect("send");

        // tts:stop must arrive promptly after the barge-in.
        tokio::time::timeout(Duration::from_millis(600), async {
            loop {
                if let Outbound::Frame(ServerFrame::Tts { state: TtsState::Stop, .. }) =
                    harness.next_outbound().await
                {
                    break;
                }
            }
        })
        .await
        .expect("tts:stop within the cancel deadline");

        // The preempted answer is kept, marked truncated.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let truncated = harness
                    .store
                    .messages()
                    .iter()
                    .any(|m| m.emotion.as_deref() == Some("truncated"));
                if truncated {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("truncated assistant message persisted");

        // The new turn answers the barge-in text.
        harness.collect_until_finished().await;
        let messages = harness.store.messages();
        assert!(messages.iter().any(|m| m.content == "停" && m.role == Role::User));
    }

    #[tokio::test]
    async fn inputs_collapse_to_latest_while_transcribing() {
        let mut config = AgentConfig::default();
        config.audio_settings.min_recording_duration = 0.1;
        let mut harness = start_session(
            json!({ "sentences": ["好的。"] }),
            json!({ "text": "讲个恐龙的故事", "delay_ms": 700 }),
            config,
        )
        .await;

        // Manual capture: start, stream frames, stop -> TRANSCRIBING.
        harness
            .cmd_tx
            .send(SessionCommand::Frame(ClientFrame::Listen {
                state: ListenState::Start,
                mode: None,
                text: None,
                agent_id: Some(1),
                session_id: Some("S1".to_string()),
            }))
            .expect("send");
        for _ in 0..10 {
            harness
                .cmd_tx
                .send(SessionCommand::Audio(vec![0u8; 60]))
                .expect("send");
        }
        harness
            .cmd_tx
            .send(SessionCommand::Frame(ClientFrame::Listen {
                state: ListenState::Stop,
                mode: None,
                text: None,
                agent_id: Some(1),
                session_id: Some("S1".to_string()),
            }))
            .expect("send");

        // Two texts while the slow ASR call runs: the first is displaced.
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.cmd_tx.send(text_frame("第一条")).expect("send");
        harness.cmd_tx.send(text_frame("第二条")).expect("send");

        let mut busy_dropped = 0;
        for _ in 0..2 {
            let outbound = harness.collect_until_finished().await;
            busy_dropped += outbound
                .iter()
                .filter(|o| {
                    matches!(
                        o,
                        Outbound::Frame(ServerFrame::Error { code: 429, .. })
                    )
                })
                .count();
        }
        assert_eq!(busy_dropped, 1, "exactly one busy_dropped error frame");

        let messages = harness.store.messages();
        let user_texts: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        assert!(user_texts.contains(&"讲个恐龙的故事"));
        assert!(user_texts.contains(&"第二条"), "latest input wins");
        assert!(!user_texts.contains(&"第一条"), "older pending input dropped");

        // The voice turn's user message carries the audio path.
        let voice_message = messages
            .iter()
            .find(|m| m.content == "讲个恐龙的故事")
            .expect("voice message");
        assert!(voice_message.audio_path.is_some());
    }

    #[tokio::test]
    async fn abort_when_idle_is_a_no_op() {
        let mut harness = start_session(
            json!({ "sentences": ["好。"] }),
            json!({}),
            AgentConfig::default(),
        )
        .await;

        harness
            .cmd_tx
            .send(SessionCommand::Frame(ClientFrame::Abort {
                reason: None,
                session_id: Some("S1".to_string()),
            }))
            .expect("send");

        // A subsequent turn runs normally, and nothing was emitted before it.
        harness.cmd_tx.send(text_frame("你好")).expect("send");
        let outbound = harness.collect_until_finished().await;
        let first_frame = outbound
            .iter()
            .find_map(|o| match o {
                Outbound::Frame(f) => Some(f),
                _ => None,
            })
            .expect("frames present");
        assert!(
            matches!(first_frame, ServerFrame::Llm { .. }),
            "no error/tts frames from the idle abort"
        );
    }

    #[tokio::test]
    async fn detach_then_teardown_enqueues_analysis_and_saves_memory() {
        let harness = start_session(
            json!({ "sentences": ["好。"] }),
            json!({}),
            AgentConfig::default(),
        )
        .await;
        harness
            .store
            .memory
            .lock()
            .expect("lock")
            .clone_from(&json!({ "preferences": { "current_voice": "mama" } }));

        let store = harness.store.clone();
        harness.cmd_tx.send(SessionCommand::Close).expect("send");
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.analyses.lock().expect("lock").is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("analysis enqueued on teardown");
        assert_eq!(store.analyses.lock().expect("lock")[0], "S1");
    }
}
