//! Session listing and message history.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use kaiwa_pipeline::Role;

use crate::state::AppState;

use super::{fail, ok, require_user};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}", axum::routing::delete(delete_session))
        .route("/sessions/{id}/messages", get(session_messages))
}

async fn list_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.list_sessions(user.id).await {
        Ok(sessions) => ok(sessions),
        Err(err) => fail(500, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    agent_id: i64,
    #[serde(default)]
    copilot_mode: bool,
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.get_agent_for_user(req.agent_id, user.id).await {
        Ok(Some(_)) => {}
        Ok(None) => return fail(404, "agent not found"),
        Err(err) => return fail(500, err.to_string()),
    }
    match state
        .store
        .create_session(user.id, req.agent_id, req.copilot_mode, None)
        .await
    {
        Ok(session) => ok(session),
        Err(err) => fail(500, err.to_string()),
    }
}

async fn session_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.get_session(&id).await {
        Ok(Some(session)) if session.user_id == user.id => {}
        Ok(_) => return fail(404, "session not found"),
        Err(err) => return fail(500, err.to_string()),
    }
    match state.store.session_messages(&id).await {
        Ok(messages) => {
            let rendered: Vec<_> = messages
                .iter()
                .map(|m| {
                    json!({
                        "id": m.id,
                        "role": match m.role { Role::User => "user", Role::Assistant => "assistant" },
                        "content": m.content,
                        "audio_path": m.audio_path,
                        "emotion": m.emotion,
                        "copilot_mode": m.copilot_mode,
                        "created_at": m.created_at_ms,
                    })
                })
                .collect();
            ok(rendered)
        }
        Err(err) => fail(500, err.to_string()),
    }
}

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.get_session(&id).await {
        Ok(Some(session)) if session.user_id == user.id => {}
        Ok(_) => return fail(404, "session not found"),
        Err(err) => return fail(500, err.to_string()),
    }

    // A live actor for this session goes down with it.
    if let Some(handle) = state.sessions.write().await.remove(&id) {
        let _ = handle.cmd_tx.send(kaiwa_pipeline::SessionCommand::Close);
    }

    match state.store.delete_session(&id).await {
        Ok(deleted) => ok(json!({ "deleted": deleted })),
        Err(err) => fail(500, err.to_string()),
    }
}
