//! Login, registration and identity.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{hash_password, verify_password};
use crate::state::AppState;

use super::{fail, ok, require_user, unauthorized};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    login_name: String,
    password: String,
    #[serde(default)]
    display_name: String,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    let login_name = req.login_name.trim();
    if login_name.is_empty() || req.password.len() < 6 {
        return fail(400, "login_name required, password at least 6 chars");
    }
    match state.store.find_user_by_login(login_name).await {
        Ok(Some(_)) => return fail(409, "login name already taken"),
        Ok(None) => {}
        Err(err) => return fail(500, err.to_string()),
    }

    let hashed = hash_password(&req.password);
    match state
        .store
        .create_user(login_name, &hashed, req.display_name.trim())
        .await
    {
        Ok(user) => match state.auth.issue(user.id) {
            Ok(token) => ok(json!({ "user": user, "token": token })),
            Err(err) => fail(500, err.to_string()),
        },
        Err(err) => fail(500, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    login_name: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    let user = match state.store.find_user_by_login(req.login_name.trim()).await {
        Ok(Some(user)) => user,
        Ok(None) => return unauthorized("unknown user or wrong password"),
        Err(err) => return fail(500, err.to_string()),
    };
    if !verify_password(&req.password, &user.password_hash) {
        return unauthorized("unknown user or wrong password");
    }
    match state.auth.issue(user.id) {
        Ok(token) => ok(json!({ "user": user, "token": token })),
        Err(err) => fail(500, err.to_string()),
    }
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match require_user(&state, &headers).await {
        Ok(user) => ok(user),
        Err(response) => response,
    }
}
