//! One conversational turn: transcription, generation, synthesis.
//!
//! Runs as a task spawned by the orchestrator; all state shared with the
//! actor goes through [`TurnProgress`] (for truncation on barge-in) and
//! `TurnEvent` commands posted back to the mailbox. Aborting the task is the
//! cancellation mechanism: provider chunk streams observe their consumer
//! disappearing and unwind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use kaiwa_core::audio::FRAME_DURATION_MS;
use kaiwa_core::text::{parse_emotion, parse_voice_segments, SentenceAccumulator};
use kaiwa_core::{Error, ServerFrame, TtsState};

use kaiwa_modules::{ModuleKind, StreamChunk};

use crate::history;
use crate::listening::frame_packets;
use crate::orchestrator::{
    send_frame, Outbound, SessionCommand, TurnDeps, TurnEvent, TurnOutcome,
};
use crate::state::Phase;
use crate::store::{NewMessage, Role};

/// Keep at most this much synthesized audio ahead of realtime in the socket
/// queue, so a barge-in stops audible output quickly.
const AUDIO_BUFFER_MS: u64 = 300;

#[derive(Debug, Clone)]
pub enum TurnSource {
    /// A `text` frame from the client.
    Text,
    /// A segmented voice utterance awaiting transcription.
    Voice { packets: Vec<Vec<u8>>, duration_secs: f64 },
    /// Speech already transcribed by the interrupt path.
    Transcribed,
    /// Opening greeting on session attach; no user message is persisted.
    Opening,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub source: TurnSource,
    pub text: Option<String>,
    pub emotion: String,
    pub confidence: f32,
    pub audio_path: Option<String>,
}

impl TurnRequest {
    pub fn text(content: String) -> Self {
        Self {
            source: TurnSource::Text,
            text: Some(content),
            emotion: "neutral".to_string(),
            confidence: 1.0,
            audio_path: None,
        }
    }

    pub fn voice(packets: Vec<Vec<u8>>, duration_secs: f64) -> Self {
        Self {
            source: TurnSource::Voice { packets, duration_secs },
            text: None,
            emotion: "neutral".to_string(),
            confidence: 1.0,
            audio_path: None,
        }
    }

    pub fn opening() -> Self {
        Self {
            source: TurnSource::Opening,
            text: None,
            emotion: "neutral".to_string(),
            confidence: 1.0,
            audio_path: None,
        }
    }
}

/// State the actor can observe after aborting the turn task.
#[derive(Debug, Default)]
pub struct TurnProgress {
    emitted: Mutex<String>,
    last_sentence: Mutex<Option<String>>,
    emotion: Mutex<Option<String>>,
    tts_active: AtomicBool,
}

impl TurnProgress {
    pub fn emitted_text(&self) -> String {
        self.emitted.lock().expect("progress poisoned").clone()
    }

    pub fn last_sentence(&self) -> Option<String> {
        self.last_sentence.lock().expect("progress poisoned").clone()
    }

    pub fn emotion(&self) -> Option<String> {
        self.emotion.lock().expect("progress poisoned").clone()
    }

    pub fn tts_active(&self) -> bool {
        self.tts_active.load(Ordering::Acquire)
    }

    fn append(&self, sentence: &str) {
        let mut emitted = self.emitted.lock().expect("progress poisoned");
        if !emitted.is_empty() {
            emitted.push(' ');
        }
        emitted.push_str(sentence);
        *self.last_sentence.lock().expect("progress poisoned") = Some(sentence.to_string());
    }

    fn set_emotion(&self, label: &str) {
        let mut emotion = self.emotion.lock().expect("progress poisoned");
        if emotion.is_none() {
            *emotion = Some(label.to_string());
        }
    }
}

pub(crate) async fn run_turn(
    deps: TurnDeps,
    turn_id: u64,
    mut request: TurnRequest,
    progress: Arc<TurnProgress>,
) {
    let outcome = match drive_turn(&deps, turn_id, &mut request, &progress).await {
        Ok(outcome) => outcome,
        Err(err) => {
            report_failure(&deps, &progress, &err).await;
            TurnOutcome::Failed
        }
    };

    let _ = deps
        .events
        .send(SessionCommand::Turn(TurnEvent::Finished { turn_id, outcome }));
}

async fn drive_turn(
    deps: &TurnDeps,
    turn_id: u64,
    request: &mut TurnRequest,
    progress: &Arc<TurnProgress>,
) -> Result<TurnOutcome, Error> {
    // Transcription phase for raw voice input.
    if let TurnSource::Voice { packets, duration_secs } = &request.source {
        set_phase(deps, turn_id, Phase::Transcribing);
        let (text, audio_path) =
            transcribe(deps, packets, *duration_secs).await?;
        if text.is_empty() {
            debug!(session = %deps.ctx.session_id, "empty transcript, turn ends quietly");
            return Ok(TurnOutcome::Empty);
        }
        request.text = Some(text);
        request.audio_path = Some(audio_path);
    }

    let user_text = request.text.clone().unwrap_or_default();

    // Opening turns speak unprompted; everything else persists the user side.
    let prompt_text = match request.source {
        TurnSource::Opening => {
            "请主动和孩子打个招呼，简短自然，符合你的角色设定。".to_string()
        }
        _ => {
            deps.store
                .append_message(NewMessage {
                    session_id: deps.ctx.session_id.clone(),
                    agent_id: deps.ctx.agent_id,
                    role: Role::User,
                    content: user_text.clone(),
                    audio_path: request.audio_path.clone(),
                    emotion: Some(request.emotion.clone()),
                    copilot_mode: deps.ctx.copilot_mode,
                })
                .await?;
            user_text.clone()
        }
    };

    set_phase(deps, turn_id, Phase::Generating);
    let full_content = generate_and_speak(deps, turn_id, &prompt_text, progress).await?;

    // Persist the assistant side even when the model said nothing.
    deps.store
        .append_message(NewMessage {
            session_id: deps.ctx.session_id.clone(),
            agent_id: deps.ctx.agent_id,
            role: Role::Assistant,
            content: full_content,
            audio_path: None,
            emotion: progress.emotion(),
            copilot_mode: deps.ctx.copilot_mode,
        })
        .await?;

    send_frame(&deps.out, ServerFrame::llm_finished());

    // Best-effort follow-ups; failures are logged, never surfaced.
    if let Err(err) = deps
        .store
        .compact_if_needed(deps.ctx.agent_id, deps.ctx.copilot_mode, deps.summarizer.as_ref())
        .await
    {
        warn!(error = %err, agent = deps.ctx.agent_id, "history compaction failed");
    }

    Ok(TurnOutcome::Completed)
}

async fn transcribe(
    deps: &TurnDeps,
    packets: &[Vec<u8>],
    duration_secs: f64,
) -> Result<(String, String), Error> {
    let asr = deps
        .registry
        .resolve(ModuleKind::Asr, &deps.ctx.module_params)
        .await?;

    let framed = frame_packets(packets);
    let audio_path = deps
        .store
        .save_user_audio(&deps.ctx.session_id, &framed)
        .await?;

    let mut scope = deps.metrics.start(
        asr.name().to_string(),
        module_model(deps, ModuleKind::Asr),
        Some(deps.ctx.session_id.clone()),
        framed.len(),
    );

    let args = json!({
        "audio": base64::engine::general_purpose::STANDARD.encode(&framed),
        "language": deps.ctx.config.audio_settings.language,
        "baby_talk": deps.ctx.config.audio_settings.enable_baby_talk_mode,
        "format": "opus",
        "sample_rate": 16_000,
    });

    let result = timeout(deps.timeouts.asr_final, asr.call("transcribe", args))
        .await
        .map_err(|_| Error::Timeout { phase: "asr_final" })
        .and_then(|r| r);

    match result {
        Ok(payload) => {
            scope.mark_first_byte();
            let text = payload
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            scope.finish("ok", None, None, text.len());
            debug!(secs = duration_secs, chars = text.len(), "utterance transcribed");
            Ok((text, audio_path))
        }
        Err(err) => {
            scope.finish(err.kind().as_str(), None, None, 0);
            Err(err)
        }
    }
}

/// Stream the LLM while feeding completed sentences to TTS in order. The two
/// halves overlap: synthesis of sentence N runs while the model is still
/// producing sentence N+1.
async fn generate_and_speak(
    deps: &TurnDeps,
    turn_id: u64,
    user_text: &str,
    progress: &Arc<TurnProgress>,
) -> Result<String, Error> {
    let llm = deps
        .registry
        .resolve(ModuleKind::Llm, &deps.ctx.module_params)
        .await?;

    let messages = history::assemble_messages(
        deps.store.as_ref(),
        &deps.ctx.config,
        deps.ctx.agent_id,
        deps.ctx.copilot_mode,
        user_text,
    )
    .await?;

    let mut scope = deps.metrics.start(
        llm.name().to_string(),
        module_model(deps, ModuleKind::Llm),
        Some(deps.ctx.session_id.clone()),
        history::message_chars(&messages),
    );

    let args = json!({ "messages": messages });
    let model_override = kaiwa_modules::ModuleRegistry::selection_config(
        &deps.ctx.module_params,
        ModuleKind::Llm,
    );
    let args = match model_override.get("model").and_then(Value::as_str) {
        Some(model) => {
            let mut args = args;
            args["model"] = json!(model);
            args
        }
        None => args,
    };

    // One retry on a transient failure before any content arrived.
    let mut stream = match llm.call_stream("chat_completion", args.clone()).await {
        Ok(stream) => stream,
        Err(err) if err.is_retriable() => {
            scope.finish(err.kind().as_str(), None, None, 0);
            warn!(error = %err, "llm call failed, retrying once");
            tokio::time::sleep(Duration::from_millis(300)).await;
            scope = deps.metrics.start(
                llm.name().to_string(),
                module_model(deps, ModuleKind::Llm),
                Some(deps.ctx.session_id.clone()),
                history::message_chars(args["messages"].as_array().map_or(&[], Vec::as_slice)),
            );
            llm.call_stream("chat_completion", args).await?
        }
        Err(err) => {
            scope.finish(err.kind().as_str(), None, None, 0);
            return Err(err);
        }
    };
    scope.mark_first_byte();

    // Both halves run inside this task so aborting the turn kills generation
    // and synthesis together; the channel decouples their pace.
    let (sentence_tx, sentence_rx) = mpsc::channel::<String>(8);
    let (consumed, spoke) = tokio::join!(
        consume_llm(deps, &mut stream, &mut scope, progress, sentence_tx),
        speak_sentences(deps, turn_id, sentence_rx, progress),
    );

    let LlmStreamOutput { full_content, usage } = match consumed {
        Ok(output) => output,
        Err((err, partial)) => {
            let (prompt_tokens, completion_tokens) = token_counts(&partial.usage);
            scope.finish(
                err.kind().as_str(),
                prompt_tokens,
                completion_tokens,
                partial.full_content.len(),
            );
            return Err(err);
        }
    };

    let (prompt_tokens, completion_tokens) = token_counts(&usage);
    scope.finish("ok", prompt_tokens, completion_tokens, full_content.len());
    spoke?;

    Ok(strip_emotion_prefix(&full_content))
}

struct LlmStreamOutput {
    full_content: String,
    usage: Value,
}

/// Read deltas, segment into sentences, forward each to the synthesis queue.
/// Consumes the sentence sender so the speaker sees end-of-stream when the
/// model finishes (or fails).
async fn consume_llm(
    deps: &TurnDeps,
    stream: &mut kaiwa_modules::ChunkStream,
    scope: &mut kaiwa_modules::MonitorScope,
    progress: &Arc<TurnProgress>,
    sentence_tx: mpsc::Sender<String>,
) -> Result<LlmStreamOutput, (Error, LlmStreamOutput)> {
    let deadline = Instant::now() + deps.timeouts.llm_total;
    let mut accumulator = SentenceAccumulator::default();
    let mut output = LlmStreamOutput {
        full_content: String::new(),
        usage: Value::Null,
    };
    let mut got_first_token = false;
    let mut emitted_any = false;

    loop {
        let wait = if got_first_token {
            deadline.saturating_duration_since(Instant::now())
        } else {
            deps.timeouts.llm_first_token
        };
        let chunk = match timeout(wait, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(err))) => return Err((err, output)),
            Ok(None) => break,
            Err(_) => {
                let err = Error::Timeout {
                    phase: if got_first_token { "llm_total" } else { "llm_first_token" },
                };
                return Err((err, output));
            }
        };
        match chunk {
            StreamChunk::Delta(delta) => {
                if !got_first_token {
                    got_first_token = true;
                    scope.mark_first_token();
                }
                output.full_content.push_str(&delta);
                for sentence in accumulator.push(&delta) {
                    emit_sentence(deps, progress, &sentence_tx, sentence, &mut emitted_any).await;
                }
            }
            StreamChunk::Done(payload) => {
                if let Some(usage) = payload.get("usage").filter(|u| !u.is_null()) {
                    output.usage = usage.clone();
                }
            }
            StreamChunk::Audio(_) => {}
        }
    }

    if let Some(rest) = accumulator.flush() {
        emit_sentence(deps, progress, &sentence_tx, rest, &mut emitted_any).await;
    }
    Ok(output)
}

async fn emit_sentence(
    deps: &TurnDeps,
    progress: &Arc<TurnProgress>,
    sentence_tx: &mpsc::Sender<String>,
    sentence: String,
    emitted_any: &mut bool,
) {
    let (emotion, clean) = if *emitted_any {
        (None, sentence.as_str())
    } else {
        parse_emotion(&sentence)
    };
    if let Some(label) = emotion {
        progress.set_emotion(label);
    }
    let clean = clean.to_string();
    if clean.is_empty() {
        return;
    }
    *emitted_any = true;
    progress.append(&clean);
    send_frame(
        &deps.out,
        ServerFrame::llm_sentence(clean.clone(), progress.emotion()),
    );
    // Backpressure: the TTS queue caps how far generation runs ahead.
    let _ = sentence_tx.send(clean).await;
}

/// Sequential synthesis keeps sentence order; no interleaving is possible
/// because this is the only consumer of the sentence queue.
async fn speak_sentences(
    deps: &TurnDeps,
    turn_id: u64,
    mut sentences: mpsc::Receiver<String>,
    progress: &Arc<TurnProgress>,
) -> Result<(), Error> {
    let tts = deps
        .registry
        .resolve(ModuleKind::Tts, &deps.ctx.module_params)
        .await?;
    let mut spoke = false;

    while let Some(sentence) = sentences.recv().await {
        if !spoke {
            spoke = true;
            set_phase(deps, turn_id, Phase::Speaking);
        }
        synthesize_sentence(deps, tts.as_ref(), &sentence, progress).await?;
    }
    Ok(())
}

async fn synthesize_sentence(
    deps: &TurnDeps,
    tts: &dyn kaiwa_modules::Module,
    sentence: &str,
    progress: &Arc<TurnProgress>,
) -> Result<(), Error> {
    progress.tts_active.store(true, Ordering::Release);
    send_frame(&deps.out, ServerFrame::tts(TtsState::Start));
    send_frame(&deps.out, ServerFrame::sentence_start(sentence.to_string()));

    let result = synthesize_segments(deps, tts, sentence).await;

    send_frame(&deps.out, ServerFrame::tts(TtsState::Stop));
    progress.tts_active.store(false, Ordering::Release);
    result
}

async fn synthesize_segments(
    deps: &TurnDeps,
    tts: &dyn kaiwa_modules::Module,
    sentence: &str,
) -> Result<(), Error> {
    let voice_enabled = deps.ctx.config.function_settings.enable_user_clone_voice;
    let segments = parse_voice_segments(sentence);

    for segment in segments {
        if segment.text.is_empty() {
            continue;
        }
        let voice = if voice_enabled {
            deps.resolve_voice(segment.voice.as_deref()).await
        } else {
            deps.ctx.config.profile.character.voice_name.clone()
        };

        let mut scope = deps.metrics.start(
            tts.name().to_string(),
            module_model(deps, ModuleKind::Tts),
            Some(deps.ctx.session_id.clone()),
            segment.text.len(),
        );

        let mut args = json!({ "text": segment.text });
        if !voice.is_empty() {
            args["voice"] = json!(voice);
        }

        let mut stream = match tts.call_stream("synthesize", args).await {
            Ok(stream) => stream,
            Err(err) => {
                scope.finish(err.kind().as_str(), None, None, 0);
                return Err(err);
            }
        };

        let sentence_deadline = Instant::now() + deps.timeouts.tts_sentence;
        let started = Instant::now();
        let mut sent_ms: u64 = 0;
        let mut first = true;
        let mut bytes_out = 0usize;

        loop {
            let wait = if first {
                deps.timeouts.tts_first_byte
            } else {
                sentence_deadline.saturating_duration_since(Instant::now())
            };
            let chunk = match timeout(wait, stream.next()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) => {
                    let err = Error::Timeout {
                        phase: if first { "tts_first_byte" } else { "tts_sentence" },
                    };
                    scope.finish(err.kind().as_str(), None, None, bytes_out);
                    return Err(err);
                }
            };
            match chunk {
                Ok(StreamChunk::Audio(packet)) => {
                    if first {
                        first = false;
                        scope.mark_first_byte();
                    }
                    bytes_out += packet.len();
                    if deps.out.send(Outbound::Audio(packet)).is_err() {
                        // Client gone; the actor will tear the turn down.
                        break;
                    }
                    // Pace output so only ~AUDIO_BUFFER_MS sits unplayed.
                    sent_ms += u64::from(FRAME_DURATION_MS);
                    let elapsed = started.elapsed().as_millis() as u64;
                    if sent_ms > elapsed + AUDIO_BUFFER_MS {
                        tokio::time::sleep(Duration::from_millis(
                            sent_ms - elapsed - AUDIO_BUFFER_MS,
                        ))
                        .await;
                    }
                }
                Ok(StreamChunk::Done(_)) => break,
                Ok(StreamChunk::Delta(_)) => {}
                Err(err) => {
                    scope.finish(err.kind().as_str(), None, None, bytes_out);
                    return Err(err);
                }
            }
        }

        scope.finish("ok", None, None, bytes_out);
    }
    Ok(())
}

async fn report_failure(deps: &TurnDeps, progress: &Arc<TurnProgress>, err: &Error) {
    warn!(session = %deps.ctx.session_id, error = %err, "turn failed");
    send_frame(
        &deps.out,
        ServerFrame::Error {
            code: 500,
            message: err.to_string(),
            details: Some(json!({ "kind": err.kind().as_str() })),
        },
    );
    if progress.tts_active() {
        send_frame(&deps.out, ServerFrame::tts(TtsState::Stop));
    }

    // Keep whatever the assistant managed to say, marked so clients can
    // render it distinguishably.
    let partial = progress.emitted_text();
    if !partial.is_empty() {
        let result = deps
            .store
            .append_message(NewMessage {
                session_id: deps.ctx.session_id.clone(),
                agent_id: deps.ctx.agent_id,
                role: Role::Assistant,
                content: partial,
                audio_path: None,
                emotion: Some("error".to_string()),
                copilot_mode: deps.ctx.copilot_mode,
            })
            .await;
        if let Err(store_err) = result {
            warn!(error = %store_err, "failed to persist partial assistant message");
        }
    }
}

fn set_phase(deps: &TurnDeps, turn_id: u64, phase: Phase) {
    let _ = deps
        .events
        .send(SessionCommand::Turn(TurnEvent::Phase { turn_id, phase }));
}

fn module_model(deps: &TurnDeps, kind: ModuleKind) -> String {
    kaiwa_modules::ModuleRegistry::selection_config(&deps.ctx.module_params, kind)
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn token_counts(usage: &Value) -> (Option<i64>, Option<i64>) {
    (
        usage.get("prompt_tokens").and_then(Value::as_i64),
        usage.get("completion_tokens").and_then(Value::as_i64),
    )
}

fn strip_emotion_prefix(content: &str) -> String {
    let (_, clean) = parse_emotion(content);
    clean.to_string()
}
