//! HTTP-facing bridge endpoints (§6, §4.G): thin pass-throughs to
//! `Bridge` so the HTTP and WebSocket views of bridge state can never
//! disagree (SPEC_FULL §10).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::bridge::RelayQuery;
use crate::mailbox::Priority;
use crate::AppContext;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg.into()})))
}

fn parse_priority(s: &Option<String>) -> Option<Priority> {
    match s.as_deref() {
        Some("low") => Some(Priority::Low),
        Some("normal") => Some(Priority::Normal),
        Some("high") => Some(Priority::High),
        Some("urgent") => Some(Priority::Urgent),
        _ => None,
    }
}

async fn do_relay(ctx: &Arc<AppContext>, q: &RelayQuery) -> Result<Json<Value>, ApiError> {
    let result = ctx
        .bridge
        .relay(
            &q.from,
            &q.to,
            &q.task,
            q.context.as_deref(),
            q.project.as_deref(),
            parse_priority(&q.priority),
            q.reply_to.as_deref(),
        )
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(result))
}

pub async fn relay_get(
    State(ctx): State<Arc<AppContext>>,
    Query(q): Query<RelayQuery>,
) -> Result<Json<Value>, ApiError> {
    do_relay(&ctx, &q).await
}

pub async fn relay_post(
    State(ctx): State<Arc<AppContext>>,
    Json(q): Json<RelayQuery>,
) -> Result<Json<Value>, ApiError> {
    do_relay(&ctx, &q).await
}

pub async fn agents(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let agents = ctx.bridge.list_agents(None).await;
    Json(json!({"agents": agents}))
}

pub async fn status(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(ctx.bridge.status().await)
}
