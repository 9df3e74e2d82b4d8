//! Webhook subscriber HTTP surface (§6, §4.F).

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
pub struct SubscribeBody {
    pub inbox: String,
    pub url: String,
    pub secret: Option<String>,
}

pub async fn subscribe(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SubscribeBody>,
) -> Result<Json<Value>, ApiError> {
    let subscriber = ctx
        .webhooks
        .subscribe(&body.inbox, body.url, body.secret)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(serde_json::to_value(subscriber).unwrap_or(json!({}))))
}

pub async fn list(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let subscribers = ctx.webhooks.list().await;
    Json(json!({"subscribers": subscribers}))
}

pub async fn unsubscribe(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let removed = ctx.webhooks.unsubscribe(&id).await.map_err(|e| bad_request(e.to_string()))?;
    if !removed {
        return Err(not_found(format!("subscriber '{id}' not found")));
    }
    Ok(Json(json!({"success": true})))
}
