//! Flight Recorder HTTP surface (§6, §4.H): journal writes, context
//! synthesis, and the resumption script, plus thin session lifecycle
//! endpoints (§10 "session open/close/new").

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::recorder::{ContextSnapshot, EntryType};
use crate::AppContext;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg.into()})))
}

const CONTEXT_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalBody {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub entry_type: String,
    pub content: String,
    pub context_snapshot: Option<ContextSnapshot>,
    pub target_agent: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn journal(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<JournalBody>,
) -> Result<Json<Value>, ApiError> {
    let entry_type = parse_entry_type(&body.entry_type).ok_or_else(|| bad_request(format!("unknown entry type '{}'", body.entry_type)))?;
    save(ctx, body.agent_id, body.session_id, entry_type, body.content, body.context_snapshot, body.target_agent, body.tags).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedJournalBody {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub content: String,
    pub context_snapshot: Option<ContextSnapshot>,
    pub target_agent: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn thought(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<TypedJournalBody>,
) -> Result<Json<Value>, ApiError> {
    save(ctx, body.agent_id, body.session_id, EntryType::Thought, body.content, body.context_snapshot, body.target_agent, body.tags).await
}

pub async fn error(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<TypedJournalBody>,
) -> Result<Json<Value>, ApiError> {
    save(ctx, body.agent_id, body.session_id, EntryType::Error, body.content, body.context_snapshot, body.target_agent, body.tags).await
}

pub async fn checkpoint(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<TypedJournalBody>,
) -> Result<Json<Value>, ApiError> {
    save(ctx, body.agent_id, body.session_id, EntryType::Checkpoint, body.content, body.context_snapshot, body.target_agent, body.tags).await
}

#[allow(clippy::too_many_arguments)]
async fn save(
    ctx: Arc<AppContext>,
    agent_id: String,
    session_id: Option<String>,
    entry_type: EntryType,
    content: String,
    context_snapshot: Option<ContextSnapshot>,
    target_agent: Option<String>,
    tags: Vec<String>,
) -> Result<Json<Value>, ApiError> {
    let entry = ctx
        .recorder
        .save_entry(
            &agent_id,
            session_id.as_deref(),
            entry_type,
            &content,
            context_snapshot,
            target_agent.as_deref(),
            tags,
        )
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(serde_json::to_value(entry).unwrap_or(json!({}))))
}

fn parse_entry_type(s: &str) -> Option<EntryType> {
    match s.to_uppercase().as_str() {
        "THOUGHT" => Some(EntryType::Thought),
        "ERROR" => Some(EntryType::Error),
        "CHECKPOINT" => Some(EntryType::Checkpoint),
        "MESSAGE" => Some(EntryType::Message),
        _ => None,
    }
}

pub async fn context_for_session(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let summary = ctx
        .recorder
        .get_context_for_session(&session_id, CONTEXT_LIMIT)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(serde_json::to_value(summary).unwrap_or(json!({}))))
}

pub async fn context_for_agent(
    State(ctx): State<Arc<AppContext>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let summary = ctx
        .recorder
        .get_context_for_agent(&agent_id, CONTEXT_LIMIT)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(serde_json::to_value(summary).unwrap_or(json!({}))))
}

#[derive(Debug, Deserialize)]
pub struct ScriptQuery {
    #[serde(default, rename = "include_context")]
    pub include_context: Option<String>,
}

pub async fn script(
    State(ctx): State<Arc<AppContext>>,
    Path(agent_id): Path<String>,
    Query(query): Query<ScriptQuery>,
) -> Result<Json<Value>, ApiError> {
    let prompt = ctx
        .recorder
        .generate_universal_script(&agent_id, None)
        .await
        .map_err(|e| bad_request(e.to_string()))?;

    if query.include_context.is_some() {
        let context = ctx
            .recorder
            .get_context_for_agent(&agent_id, CONTEXT_LIMIT)
            .await
            .map_err(|e| bad_request(e.to_string()))?;
        return Ok(Json(json!({"script": prompt, "context": context})));
    }

    Ok(Json(json!({"script": prompt})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigninBody {
    pub agent_id: String,
}

pub async fn signin(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SigninBody>,
) -> Result<Json<Value>, ApiError> {
    let session = ctx
        .recorder
        .get_or_create_session(&body.agent_id, None)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(serde_json::to_value(session).unwrap_or(json!({}))))
}

pub async fn new_session(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SigninBody>,
) -> Result<Json<Value>, ApiError> {
    let session = ctx
        .recorder
        .start_new_session(&body.agent_id)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(serde_json::to_value(session).unwrap_or(json!({}))))
}

pub async fn close_session(
    State(ctx): State<Arc<AppContext>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.recorder.close_session(&session_id).await.map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(json!({"success": true})))
}

pub async fn close_agent_sessions(
    State(ctx): State<Arc<AppContext>>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.recorder
        .close_agent_sessions(&agent_id)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(json!({"success": true})))
}
