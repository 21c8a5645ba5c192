//! Device registration and the bind handshake.
//!
//! `POST /devices` is called by the device itself (no user token yet): it
//! upserts the device row and returns a short-lived six-digit challenge the
//! device shows or speaks. The owner's app then calls
//! `POST /devices/{uuid}/bind` with that challenge to record ownership.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;
use crate::store::BindOutcome;

use super::{fail, ok, require_user};

const DEVICE_TYPES: &[&str] = &["speaker", "display", "robot", "vehicle", "wearable"];
const CHALLENGE_TTL_SECS: i64 = 300;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/devices", get(list_devices).post(register_device))
        .route("/devices/{uuid}/bind", post(bind_device))
}

#[derive(Debug, Deserialize)]
struct RegisterDeviceRequest {
    device_uuid: String,
    device_type: String,
}

async fn register_device(
    State(state): State<AppState>,
    Json(req): Json<RegisterDeviceRequest>,
) -> Response {
    let device_uuid = req.device_uuid.trim();
    if device_uuid.is_empty() {
        return fail(400, "device_uuid required");
    }
    if !DEVICE_TYPES.contains(&req.device_type.as_str()) {
        return fail(400, format!("unknown device_type {}", req.device_type));
    }

    let device = match state.store.register_device(device_uuid, &req.device_type).await {
        Ok(device) => device,
        Err(err) => return fail(500, err.to_string()),
    };

    let challenge = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
    if let Err(err) = state
        .store
        .issue_device_challenge(device_uuid, &challenge, CHALLENGE_TTL_SECS)
        .await
    {
        return fail(500, err.to_string());
    }

    ok(json!({
        "device": device,
        "bind_challenge": challenge,
        "expires_in_secs": CHALLENGE_TTL_SECS,
    }))
}

#[derive(Debug, Deserialize)]
struct BindDeviceRequest {
    challenge: String,
}

async fn bind_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
    Json(req): Json<BindDeviceRequest>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state
        .store
        .bind_device(&uuid, req.challenge.trim(), user.id)
        .await
    {
        Ok(BindOutcome::Bound { device_id, is_owner }) => {
            ok(json!({ "bound": true, "device_id": device_id, "is_owner": is_owner }))
        }
        Ok(BindOutcome::UnknownDevice) => fail(404, "device not found"),
        Ok(BindOutcome::InvalidChallenge) => fail(400, "invalid bind challenge"),
        Ok(BindOutcome::ChallengeExpired) => fail(400, "bind challenge expired"),
        Err(err) => fail(500, err.to_string()),
    }
}

async fn list_devices(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.list_user_devices(user.id).await {
        Ok(devices) => ok(devices),
        Err(err) => fail(500, err.to_string()),
    }
}
