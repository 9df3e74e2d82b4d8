//! Mailbox HTTP surface (§6, §4.A): send/check/get/receive/complete/
//! approve/status/delete plus thread views. Grounded on
//! `rest/routes/sessions.rs`'s `Result<Json<Value>, (StatusCode,
//! Json<Value>)>` handler shape — errors are reported, state never
//! changes on a rejected call.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::mailbox::{FileRef, Priority, RoutingMode, SendRequest, Status};
use crate::AppContext;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg.into()})))
}

fn not_found(msg: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({"error": msg.into()})))
}

fn conflict(msg: impl Into<String>) -> ApiError {
    (StatusCode::CONFLICT, Json(json!({"error": msg.into()})))
}

fn internal(msg: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": msg.into()})),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendBody {
    pub to: String,
    pub from: String,
    pub task: String,
    pub context: Option<String>,
    #[serde(default)]
    pub files: Vec<FileRef>,
    pub project_name: Option<String>,
    pub conversation_excerpt: Option<String>,
    pub project: Option<String>,
    pub priority: Option<Priority>,
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub routing: RoutingMode,
    pub destination: Option<String>,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub require_approval: bool,
}

pub async fn send(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<SendBody>,
) -> Result<Json<Value>, ApiError> {
    let req = SendRequest {
        to: body.to,
        from: body.from,
        task: body.task,
        context: body.context,
        files: body.files,
        project_name: body.project_name,
        conversation_excerpt: body.conversation_excerpt,
        project: body.project,
        priority: body.priority,
        tags: body.tags,
        routing: body.routing,
        destination: body.destination,
        reply_to: body.reply_to,
        require_approval: body.require_approval,
    };

    let message = ctx.mailbox.send(req).await.map_err(|e| bad_request(e.to_string()))?;

    if let Err(e) = ctx
        .conversations
        .on_send(&message.from, &message.to, &message.thread_id, message.control_type)
        .await
    {
        tracing::warn!(err = %e, message_id = %message.id, "conversation session update failed");
    }

    let mut value = serde_json::to_value(&message).map_err(|e| internal(e.to_string()))?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("success".into(), json!(true));
        obj.insert("messageId".into(), json!(message.id));
    }
    Ok(Json(value))
}

#[derive(Debug, Deserialize)]
pub struct InboxQuery {
    #[serde(default, rename = "includeRead")]
    pub include_read: Option<String>,
    #[serde(default, rename = "autoApprove")]
    pub auto_approve: Option<String>,
}

fn flag_present(v: &Option<String>) -> bool {
    match v {
        None => false,
        Some(s) => s.is_empty() || s.eq_ignore_ascii_case("true") || s == "1",
    }
}

pub async fn check_inbox(
    State(ctx): State<Arc<AppContext>>,
    Path(path): Path<String>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<Value>, ApiError> {
    let include_terminal = flag_present(&query.include_read);
    let auto_approve = flag_present(&query.auto_approve);

    let messages = ctx
        .mailbox
        .check_inbox(&path, include_terminal, auto_approve)
        .await
        .map_err(|e| bad_request(e.to_string()))?;

    Ok(Json(json!({
        "inbox": path,
        "count": messages.len(),
        "messages": messages,
    })))
}

pub async fn get_message(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let message = ctx
        .mailbox
        .get_message(&id)
        .await
        .map_err(|e| not_found(e.to_string()))?;
    Ok(Json(serde_json::to_value(message).map_err(|e| internal(e.to_string()))?))
}

pub async fn receive(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let message = ctx.mailbox.mark_read(&id).await.map_err(|e| not_found(e.to_string()))?;
    Ok(Json(serde_json::to_value(message).map_err(|e| internal(e.to_string()))?))
}

pub async fn complete(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let message = ctx.mailbox.complete(&id).await.map_err(|e| conflict(e.to_string()))?;
    Ok(Json(serde_json::to_value(message).map_err(|e| internal(e.to_string()))?))
}

pub async fn approve(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let message = ctx.mailbox.approve(&id).await.map_err(|e| conflict(e.to_string()))?;
    Ok(Json(serde_json::to_value(message).map_err(|e| internal(e.to_string()))?))
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    pub status: String,
}

pub async fn update_status(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, ApiError> {
    let target = parse_status(&body.status).ok_or_else(|| bad_request(format!("unknown status '{}'", body.status)))?;
    let message = ctx
        .mailbox
        .update_status(&id, target)
        .await
        .map_err(|e| conflict(e.to_string()))?;
    Ok(Json(serde_json::to_value(message).map_err(|e| internal(e.to_string()))?))
}

fn parse_status(s: &str) -> Option<Status> {
    match s {
        "pending" => Some(Status::Pending),
        "approved" => Some(Status::Approved),
        "in_progress" => Some(Status::InProgress),
        "read" => Some(Status::Read),
        "completed" => Some(Status::Completed),
        "failed" => Some(Status::Failed),
        "expired" => Some(Status::Expired),
        _ => None,
    }
}

pub async fn delete_message(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    ctx.mailbox.delete(&id).await.map_err(|e| not_found(e.to_string()))?;
    Ok(Json(json!({"success": true})))
}

pub async fn list_threads(State(ctx): State<Arc<AppContext>>) -> Result<Json<Value>, ApiError> {
    let threads = ctx.mailbox.list_threads().await.map_err(|e| internal(e.to_string()))?;
    Ok(Json(json!({"threads": threads})))
}

pub async fn get_thread(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let messages = ctx.mailbox.get_thread(&id).await.map_err(|e| internal(e.to_string()))?;
    if messages.is_empty() {
        return Err(not_found(format!("thread '{id}' not found")));
    }
    Ok(Json(json!({"threadId": id, "messages": messages})))
}
