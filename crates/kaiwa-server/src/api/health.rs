//! Liveness probe.

use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/aitoys/v1/health", get(health))
}

async fn health() -> Response {
    // Routed only after init completes, so reaching here means healthy.
    axum::Json(json!({ "status": "ok" })).into_response()
}
