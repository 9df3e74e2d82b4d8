//! API key HTTP surface (§6 "Auth").

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::AppContext;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg.into()})))
}

fn not_found(msg: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({"error": msg.into()})))
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    pub owner: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateKeyBody>,
) -> Result<Json<Value>, ApiError> {
    let created = ctx
        .keys
        .create(&body.owner, body.permissions)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(json!({"key": created.key, "plaintext": created.plaintext})))
}

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    let keys = ctx.keys.list().await.map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(json!({"keys": keys})))
}

pub async fn revoke(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let revoked = ctx.keys.revoke(&id).await.map_err(|e| bad_request(e.to_string()))?;
    if !revoked {
        return Err(not_found(format!("key '{id}' not found")));
    }
    Ok(Json(json!({"success": true})))
}
