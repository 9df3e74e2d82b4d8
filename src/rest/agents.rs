//! Agent registry HTTP surface (§6, §4.B).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::registry::AgentSpec;
use crate::AppContext;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg.into()})))
}

fn not_found(msg: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({"error": msg.into()})))
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentBody {
    pub platform: String,
    pub name: String,
    #[serde(flatten)]
    pub spec: AgentSpec,
}

pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateAgentBody>,
) -> Result<Json<Value>, ApiError> {
    let agent = ctx
        .registry
        .upsert(&body.platform, &body.name, body.spec)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(serde_json::to_value(agent).unwrap_or(json!({}))))
}

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    let agents = ctx.registry.list().await.map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(json!({"agents": agents})))
}

pub async fn get(
    State(ctx): State<Arc<AppContext>>,
    Path((platform, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let id = format!("{platform}/{name}");
    let agent = ctx
        .registry
        .get(&id)
        .await
        .map_err(|e| bad_request(e.to_string()))?
        .ok_or_else(|| not_found(format!("agent '{id}' not found")))?;
    Ok(Json(serde_json::to_value(agent).unwrap_or(json!({}))))
}

pub async fn update(
    State(ctx): State<Arc<AppContext>>,
    Path((platform, name)): Path<(String, String)>,
    Json(spec): Json<AgentSpec>,
) -> Result<Json<Value>, ApiError> {
    let agent = ctx
        .registry
        .upsert(&platform, &name, spec)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(serde_json::to_value(agent).unwrap_or(json!({}))))
}

pub async fn delete(
    State(ctx): State<Arc<AppContext>>,
    Path((platform, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let id = format!("{platform}/{name}");
    let removed = ctx.registry.delete(&id).await.map_err(|e| bad_request(e.to_string()))?;
    if !removed {
        return Err(not_found(format!("agent '{id}' not found")));
    }
    Ok(Json(json!({"success": true})))
}

pub async fn ping(
    State(ctx): State<Arc<AppContext>>,
    Path((platform, name)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let id = format!("{platform}/{name}");
    let agent = ctx
        .registry
        .ping(&id)
        .await
        .map_err(|e| bad_request(e.to_string()))?
        .ok_or_else(|| not_found(format!("agent '{id}' not found")))?;
    Ok(Json(serde_json::to_value(agent).unwrap_or(json!({}))))
}
