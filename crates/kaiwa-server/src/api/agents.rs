//! Agent instance CRUD and the template catalog.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use kaiwa_core::config::{AgentConfig, ModuleParams};

use crate::state::AppState;

use super::{fail, ok, require_user};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/agents", get(list_agents).post(create_agent))
        .route(
            "/agents/{id}",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route("/agents/templates", get(list_templates))
}

async fn list_templates(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = require_user(&state, &headers).await {
        return response;
    }
    match state.store.list_templates().await {
        Ok(templates) => ok(templates),
        Err(err) => fail(500, err.to_string()),
    }
}

async fn list_agents(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.list_agents(user.id).await {
        Ok(agents) => ok(agents),
        Err(err) => fail(500, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateAgentRequest {
    template_id: i64,
    #[serde(default)]
    name: Option<String>,
}

async fn create_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateAgentRequest>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let template = match state.store.get_template(req.template_id).await {
        Ok(Some(template)) => template,
        Ok(None) => return fail(404, "template not found"),
        Err(err) => return fail(500, err.to_string()),
    };
    match state.store.create_agent(user.id, &template, req.name).await {
        Ok(agent) => ok(agent),
        Err(err) => fail(500, err.to_string()),
    }
}

async fn get_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.get_agent_for_user(id, user.id).await {
        Ok(Some(agent)) => ok(agent),
        Ok(None) => fail(404, "agent not found"),
        Err(err) => fail(500, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateAgentRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    module_params: Option<Value>,
    #[serde(default)]
    agent_config: Option<Value>,
}

async fn update_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<UpdateAgentRequest>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.get_agent_for_user(id, user.id).await {
        Ok(Some(_)) => {}
        Ok(None) => return fail(404, "agent not found"),
        Err(err) => return fail(500, err.to_string()),
    }

    // Blobs are validated before they land; reads assume loadable configs.
    if let Some(config) = &req.agent_config {
        if let Err(err) = AgentConfig::from_json(config) {
            return fail(400, err.to_string());
        }
    }
    if let Some(params) = &req.module_params {
        if let Err(err) = ModuleParams::from_json(params) {
            return fail(400, err.to_string());
        }
    }

    match state
        .store
        .update_agent(id, req.name, req.module_params, req.agent_config)
        .await
    {
        Ok(true) => ok(serde_json::json!({ "updated": true })),
        Ok(false) => fail(400, "nothing to update"),
        Err(err) => fail(500, err.to_string()),
    }
}

async fn delete_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.store.get_agent_for_user(id, user.id).await {
        Ok(Some(_)) => {}
        Ok(None) => return fail(404, "agent not found"),
        Err(err) => return fail(500, err.to_string()),
    }
    match state.store.delete_agent(id).await {
        Ok(deleted) => ok(serde_json::json!({ "deleted": deleted })),
        Err(err) => fail(500, err.to_string()),
    }
}
