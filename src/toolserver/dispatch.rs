//! Tool-call dispatch (§4.J): translates `tools/call` invocations 1:1
//! into mailbox operations. Follows `mcp/dispatch.rs`'s dispatch-by-name
//! shape (`McpDispatcher::dispatch`, `classify_error`).

use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use crate::mailbox::SendRequest;
use crate::AppContext;

/// A JSON-RPC error object (code/message), built from a tool failure the
/// same way `classify_error` turns an `anyhow::Error` string into a
/// typed `McpError`.
pub struct ToolError {
    pub code: i64,
    pub message: String,
}

pub fn classify_error(err: &anyhow::Error) -> ToolError {
    let msg = err.to_string();
    let code = if msg.contains("not found") || msg.contains("does not exist") {
        -32001
    } else if msg.contains("illegal transition") || msg.contains("cannot approve") {
        -32002
    } else if msg.contains("unknown tool") {
        -32601
    } else {
        -32603
    };
    ToolError { code, message: msg }
}

pub async fn dispatch(ctx: &Arc<AppContext>, tool_name: &str, arguments: Value) -> Result<Value> {
    tracing::info!(tool = tool_name, "dispatching relay tool call");
    match tool_name {
        "send" => send(ctx, arguments).await,
        "check" => check(ctx, arguments).await,
        "receive" => receive(ctx, arguments).await,
        "complete" => complete(ctx, arguments).await,
        "reply" => reply(ctx, arguments).await,
        other => Err(anyhow!("unknown tool '{other}'")),
    }
}

fn field_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn field_bool(args: &Value, key: &str) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(false)
}

async fn send(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let to = field_str(&args, "to").ok_or_else(|| anyhow!("'to' is required"))?;
    let from = field_str(&args, "from").ok_or_else(|| anyhow!("'from' is required"))?;
    let task = field_str(&args, "task").ok_or_else(|| anyhow!("'task' is required"))?;

    let priority = field_str(&args, "priority").and_then(|p| match p.as_str() {
        "low" => Some(crate::mailbox::Priority::Low),
        "normal" => Some(crate::mailbox::Priority::Normal),
        "high" => Some(crate::mailbox::Priority::High),
        "urgent" => Some(crate::mailbox::Priority::Urgent),
        _ => None,
    });

    let req = SendRequest {
        to,
        from,
        task,
        context: field_str(&args, "context"),
        project: field_str(&args, "project"),
        priority,
        reply_to: field_str(&args, "replyTo"),
        ..Default::default()
    };
    let message = ctx.mailbox.send(req).await?;
    if let Err(e) = ctx
        .conversations
        .on_send(&message.from, &message.to, &message.thread_id, message.control_type)
        .await
    {
        tracing::warn!(err = %e, message_id = %message.id, "conversation session update failed");
    }
    Ok(serde_json::to_value(message)?)
}

async fn check(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let inbox = field_str(&args, "inbox").ok_or_else(|| anyhow!("'inbox' is required"))?;
    let include_read = field_bool(&args, "includeRead");
    let auto_approve = field_bool(&args, "autoApprove");
    let messages = ctx.mailbox.check_inbox(&inbox, include_read, auto_approve).await?;
    Ok(json!({"inbox": inbox, "count": messages.len(), "messages": messages}))
}

async fn receive(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let id = field_str(&args, "id").ok_or_else(|| anyhow!("'id' is required"))?;
    let message = ctx.mailbox.mark_read(&id).await?;
    Ok(serde_json::to_value(message)?)
}

async fn complete(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let id = field_str(&args, "id").ok_or_else(|| anyhow!("'id' is required"))?;
    let message = ctx.mailbox.complete(&id).await?;
    Ok(serde_json::to_value(message)?)
}

/// `reply` resolves the original message to recover its sender before
/// calling `send` (§4.J) — the reply's `to` is the original `from`.
async fn reply(ctx: &Arc<AppContext>, args: Value) -> Result<Value> {
    let id = field_str(&args, "id").ok_or_else(|| anyhow!("'id' is required"))?;
    let task = field_str(&args, "task").ok_or_else(|| anyhow!("'task' is required"))?;
    let context = field_str(&args, "context");

    let original = ctx.mailbox.get_message(&id).await?;
    let req = SendRequest {
        to: original.from,
        from: original.to,
        task,
        context,
        reply_to: Some(id),
        ..Default::default()
    };
    let message = ctx.mailbox.send(req).await?;
    if let Err(e) = ctx
        .conversations
        .on_send(&message.from, &message.to, &message.thread_id, message.control_type)
        .await
    {
        tracing::warn!(err = %e, message_id = %message.id, "conversation session update failed");
    }
    Ok(serde_json::to_value(message)?)
}
