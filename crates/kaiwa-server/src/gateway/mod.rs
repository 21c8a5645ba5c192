//! WebSocket chat transport.
//!
//! `/ws/chat` carries JSON control frames and binary Opus packets. The
//! connection handler owns the hello handshake and frame decoding; everything
//! stateful about the conversation lives in the per-session actor, reached
//! through its mailbox. A reconnecting client (same `client_id`) re-attaches
//! to its live actor and the older socket is closed as supplanted.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kaiwa_core::config::{AgentConfig, ModuleParams};
use kaiwa_core::{AudioParams, ClientFrame, ServerFrame};
use kaiwa_pipeline::{
    Orchestrator, Outbound, OutboundSender, SessionCommand, SessionContext,
};

use crate::state::{AppState, SessionHandle};

const KNOWN_FRAME_TYPES: &[&str] = &["hello", "listen", "text", "abort", "mcp"];

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/chat", get(ws_upgrade))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    protocol_version: Option<u32>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or(query.token);

    let user_id = match token.as_deref().map(|t| state.auth.verify(t)) {
        Some(Ok(user_id)) => user_id,
        Some(Err(err)) => return crate::api::unauthorized(err.to_string()),
        None => return crate::api::unauthorized("missing token"),
    };

    if let Some(version) = query.protocol_version {
        if version != 1 {
            return crate::api::fail(400, format!("unsupported protocol_version {version}"));
        }
    }

    let client_id = query
        .client_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, client_id))
}

struct Connection {
    session_id: Option<String>,
    cmd_tx: Option<mpsc::UnboundedSender<SessionCommand>>,
    hello_done: bool,
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: i64, client_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let supplanted = Arc::new(Notify::new());

    let writer_supplanted = supplanted.clone();
    let writer = tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(outbound) => outbound,
                    None => break,
                },
                _ = writer_supplanted.notified() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: "supplanted".into(),
                        })))
                        .await;
                    break;
                }
            };
            let message = match outbound {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(text) => Message::Text(text.into()),
                    Err(err) => {
                        warn!(error = %err, "failed to serialize server frame");
                        continue;
                    }
                },
                Outbound::Audio(packet) => Message::Binary(packet.into()),
                Outbound::Close { reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection {
        session_id: None,
        cmd_tx: None,
        hello_done: false,
    };

    // Hello must complete within its deadline; everything before it is
    // dropped with a protocol error.
    let hello_deadline = tokio::time::Instant::now() + state.timeouts.hello;
    while !conn.hello_done {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = tokio::time::sleep_until(hello_deadline) => {
                debug!(%client_id, "hello deadline expired");
                let _ = out_tx.send(Outbound::Close { reason: "hello_timeout".to_string() });
                finish(writer, conn, &client_id).await;
                return;
            }
        };
        let Some(Ok(message)) = message else {
            finish(writer, conn, &client_id).await;
            return;
        };
        match message {
            Message::Text(text) => match parse_frame(text.as_str()) {
                ParsedFrame::Frame(ClientFrame::Hello { version, .. }) => {
                    if version != 1 {
                        send(&out_tx, ServerFrame::error(400, "unsupported protocol version"));
                        continue;
                    }
                    let session_id = Uuid::new_v4().to_string();
                    send(
                        &out_tx,
                        ServerFrame::Hello {
                            transport: "websocket".to_string(),
                            audio_params: AudioParams::default(),
                            session_id: session_id.clone(),
                        },
                    );
                    conn.session_id = Some(session_id);
                    conn.hello_done = true;
                    info!(%client_id, user_id, "hello exchange complete");
                }
                ParsedFrame::Frame(_) | ParsedFrame::Malformed(_) => {
                    send(&out_tx, ServerFrame::error(400, "hello required first"));
                }
                ParsedFrame::Unknown(frame_type) => {
                    debug!(%frame_type, "ignoring unknown frame before hello");
                }
            },
            Message::Binary(_) => {
                send(&out_tx, ServerFrame::error(400, "hello required first"));
            }
            // Keepalive is transport-level; axum answers pings itself.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => {
                finish(writer, conn, &client_id).await;
                return;
            }
        }
    }

    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            _ = supplanted.notified() => {
                debug!(%client_id, "connection supplanted by a newer socket");
                break;
            }
        };
        let Some(Ok(message)) = message else { break };

        match message {
            Message::Text(text) => match parse_frame(text.as_str()) {
                ParsedFrame::Frame(frame) => {
                    handle_frame(
                        &state,
                        &mut conn,
                        &out_tx,
                        &supplanted,
                        user_id,
                        &client_id,
                        frame,
                    )
                    .await;
                }
                ParsedFrame::Unknown(frame_type) => {
                    debug!(%frame_type, "ignoring unknown frame type");
                }
                ParsedFrame::Malformed(err) => {
                    send(&out_tx, ServerFrame::error(400, format!("malformed frame: {err}")));
                }
            },
            Message::Binary(packet) => {
                if let Some(cmd_tx) = &conn.cmd_tx {
                    let _ = cmd_tx.send(SessionCommand::Audio(packet.to_vec()));
                } else {
                    debug!(%client_id, "audio before session binding, dropped");
                }
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    finish(writer, conn, &client_id).await;
}

enum ParsedFrame {
    Frame(ClientFrame),
    Unknown(String),
    Malformed(String),
}

/// Two-step parse so unknown `type` values stay forward-compatible.
fn parse_frame(text: &str) -> ParsedFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return ParsedFrame::Malformed(err.to_string()),
    };
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if !KNOWN_FRAME_TYPES.contains(&frame_type.as_str()) {
        return ParsedFrame::Unknown(frame_type);
    }
    match serde_json::from_value::<ClientFrame>(value) {
        Ok(frame) => ParsedFrame::Frame(frame),
        Err(err) => ParsedFrame::Malformed(err.to_string()),
    }
}

async fn handle_frame(
    state: &AppState,
    conn: &mut Connection,
    out_tx: &OutboundSender,
    supplant_notify: &Arc<Notify>,
    user_id: i64,
    client_id: &str,
    frame: ClientFrame,
) {
    match &frame {
        ClientFrame::Hello { .. } => {
            // Duplicate hello: echo the negotiated parameters again.
            send(
                out_tx,
                ServerFrame::Hello {
                    transport: "websocket".to_string(),
                    audio_params: AudioParams::default(),
                    session_id: conn.session_id.clone().unwrap_or_default(),
                },
            );
            return;
        }
        ClientFrame::Text { agent_id, session_id, .. } => {
            if let Err(err) = bind_session(
                state,
                conn,
                out_tx,
                supplant_notify,
                user_id,
                client_id,
                session_id.clone(),
                Some(*agent_id),
            )
            .await
            {
                send(out_tx, err);
                return;
            }
        }
        ClientFrame::Listen { agent_id, session_id, .. } => {
            if let Err(err) = bind_session(
                state,
                conn,
                out_tx,
                supplant_notify,
                user_id,
                client_id,
                session_id.clone(),
                *agent_id,
            )
            .await
            {
                send(out_tx, err);
                return;
            }
        }
        // Abort and mcp only make sense against an existing session.
        ClientFrame::Abort { .. } | ClientFrame::Mcp { .. } => {}
    }

    if let Some(cmd_tx) = &conn.cmd_tx {
        let _ = cmd_tx.send(SessionCommand::Frame(frame));
    }
}

/// Attach this connection to the session actor, creating session row and
/// actor on first use. Returns an error frame for the client on failure.
#[allow(clippy::too_many_arguments)]
async fn bind_session(
    state: &AppState,
    conn: &mut Connection,
    out_tx: &OutboundSender,
    supplant_notify: &Arc<Notify>,
    user_id: i64,
    client_id: &str,
    requested_session: Option<String>,
    agent_id: Option<i64>,
) -> Result<(), ServerFrame> {
    let target = requested_session.or_else(|| conn.session_id.clone());

    // Already bound to the right session.
    if conn.cmd_tx.is_some() && target.as_deref() == conn.session_id.as_deref() {
        return Ok(());
    }

    let session_id = target.ok_or_else(|| ServerFrame::error(400, "missing session_id"))?;

    // Resume path: a live actor for this session. The previous socket, if
    // still open, is told it has been supplanted.
    {
        let mut sessions = state.sessions.write().await;
        if let Some(handle) = sessions.get_mut(&session_id) {
            let _ = handle.cmd_tx.send(SessionCommand::AttachOutput(out_tx.clone()));
            if let Some(previous) = handle.supplant.take() {
                previous.notify_waiters();
            }
            handle.supplant = Some(supplant_notify.clone());
            handle.client_id = client_id.to_string();
            conn.session_id = Some(session_id.clone());
            conn.cmd_tx = Some(handle.cmd_tx.clone());
            info!(%session_id, client_id, "attached to live session");
            return Ok(());
        }
    }

    // Fresh binding: we need an agent.
    let agent_id =
        agent_id.ok_or_else(|| ServerFrame::error(400, "missing agent_id"))?;
    let agent = state
        .store
        .get_agent_for_user(agent_id, user_id)
        .await
        .map_err(|err| ServerFrame::error(500, err.to_string()))?
        .ok_or_else(|| ServerFrame::error(404, "agent not found or not yours"))?;

    let config = AgentConfig::from_json(&agent.agent_config)
        .map_err(|err| ServerFrame::error(500, format!("agent config: {err}")))?;
    let module_params = ModuleParams::from_json(&agent.module_params)
        .map_err(|err| ServerFrame::error(500, format!("module params: {err}")))?;

    // Reuse the persisted session row when the client brought its own id.
    let session = match state
        .store
        .get_session(&session_id)
        .await
        .map_err(|err| ServerFrame::error(500, err.to_string()))?
    {
        Some(session) if session.user_id != user_id => {
            return Err(ServerFrame::error(403, "session belongs to another user"));
        }
        Some(session) => session,
        None => state
            .store
            .create_session(user_id, agent.id, false, Some(session_id.clone()))
            .await
            .map_err(|err| ServerFrame::error(500, err.to_string()))?,
    };

    let ctx = SessionContext {
        session_id: session.session_id.clone(),
        user_id,
        agent_id: agent.id,
        copilot_mode: session.copilot_mode,
        config,
        module_params,
    };

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let actor = Orchestrator::new(
        ctx,
        state.registry.clone(),
        state.store.clone(),
        state.metrics.clone(),
        out_tx.clone(),
        cmd_tx.clone(),
        state.timeouts,
    );
    let join = actor.spawn(cmd_rx);

    // Reap the registry entry and close the session row when the actor ends.
    {
        let state = state.clone();
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            let _ = join.await;
            state.remove_session(&session_id).await;
            if let Err(err) = state.store.close_session(&session_id).await {
                warn!(error = %err, %session_id, "failed to close session row");
            }
        });
    }

    state.sessions.write().await.insert(
        session.session_id.clone(),
        SessionHandle {
            cmd_tx: cmd_tx.clone(),
            client_id: client_id.to_string(),
            agent_id: agent.id,
            supplant: Some(supplant_notify.clone()),
        },
    );

    info!(session_id = %session.session_id, agent_id = agent.id, "session actor started");
    conn.session_id = Some(session.session_id);
    conn.cmd_tx = Some(cmd_tx);
    Ok(())
}

fn send(out_tx: &OutboundSender, frame: ServerFrame) {
    let _ = out_tx.send(Outbound::Frame(frame));
}

async fn finish(writer: tokio::task::JoinHandle<()>, conn: Connection, client_id: &str) {
    if let Some(cmd_tx) = &conn.cmd_tx {
        let _ = cmd_tx.send(SessionCommand::Detach);
    }
    debug!(client_id, session = ?conn.session_id, "connection closed");
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_frames_parse_and_unknown_are_ignored() {
        match parse_frame(r#"{"type":"text","content":"你好","agent_id":1}"#) {
            ParsedFrame::Frame(ClientFrame::Text { content, agent_id, .. }) => {
                assert_eq!(content, "你好");
                assert_eq!(agent_id, 1);
            }
            _ => panic!("text frame should parse"),
        }

        assert!(matches!(
            parse_frame(r#"{"type":"telemetry","battery":88}"#),
            ParsedFrame::Unknown(t) if t == "telemetry"
        ));

        assert!(matches!(
            parse_frame(r#"{"type":"text"}"#),
            ParsedFrame::Malformed(_)
        ));

        assert!(matches!(parse_frame("not json"), ParsedFrame::Malformed(_)));
    }
}
