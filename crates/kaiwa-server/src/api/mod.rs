//! HTTP surface consumed by the front-end.
//!
//! Uniform envelope `{code, data, msg}` with `code = 0` for success and HTTP
//! 200 for everything except auth failures.

pub mod agents;
pub mod auth;
pub mod devices;
pub mod health;
pub mod sessions;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info_span;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
        )
    });

    Router::new()
        .merge(auth::router())
        .merge(agents::router())
        .merge(devices::router())
        .merge(sessions::router())
        .merge(health::router())
        .merge(crate::gateway::router())
        .layer(trace_layer)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Success envelope.
pub fn ok<T: Serialize>(data: T) -> Response {
    Json(json!({ "code": 0, "data": data, "msg": "ok" })).into_response()
}

/// Business failure: HTTP 200, non-zero code.
pub fn fail(code: i64, msg: impl Into<String>) -> Response {
    Json(json!({ "code": code, "data": null, "msg": msg.into() })).into_response()
}

/// Auth failure is the one case that surfaces as an HTTP status.
pub fn unauthorized(msg: impl Into<String>) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "code": 401, "data": null, "msg": msg.into() })),
    )
        .into_response()
}

/// Resolve the bearer user or bail with 401.
pub async fn require_user(
    state: &AppState,
    headers: &axum::http::HeaderMap,
) -> Result<crate::store::UserRow, Response> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| unauthorized("missing bearer token"))?;
    let user_id = state
        .auth
        .verify(token)
        .map_err(|err| unauthorized(err.to_string()))?;
    state
        .store
        .get_user(user_id)
        .await
        .map_err(|err| fail(500, err.to_string()))?
        .ok_or_else(|| unauthorized("unknown user"))
}
