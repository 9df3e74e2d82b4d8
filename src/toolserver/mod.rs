//! Protocol-adapter tool server (§4.J): a streamed request/response
//! transport exposing `send`/`check`/`receive`/`complete`/`reply` as
//! tools with structured schemas. Each connection gets a unique id; the
//! server advertises a POST endpoint parameterized with that id for the
//! client to push JSON-RPC frames, and responses stream back over the
//! open connection.
//!
//! The SSE wiring here combines two patterns: `rest/sse.rs`'s
//! broadcast-to-`Sse` bridge for the streaming half, and
//! `mcp/dispatch.rs`'s dispatch-by-tool-name shape (`toolserver::dispatch`)
//! for the call semantics. JSON-RPC framing follows the legacy MCP
//! HTTP+SSE transport: a GET opens the stream and announces a
//! session-scoped POST endpoint in an `endpoint` event; the client POSTs
//! frames there and every response (or JSON-RPC error) is pushed back as
//! a `message` event on the open stream rather than in the POST response
//! body.

pub mod dispatch;
pub mod tools;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::AppContext;

struct ToolServerState {
    ctx: Arc<AppContext>,
    connections: Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>,
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    let state = Arc::new(ToolServerState {
        ctx,
        connections: Mutex::new(HashMap::new()),
    });

    Router::new()
        .route("/tools/sse", get(open_stream))
        .route("/tools/messages", post(post_frame))
        .with_state(state)
}

async fn open_stream(State(state): State<Arc<ToolServerState>>) -> impl IntoResponse {
    let connection_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    state.connections.lock().await.insert(connection_id.clone(), tx);

    let endpoint = format!("/tools/messages?connectionId={connection_id}");
    let announce = stream::once(async move {
        Ok::<Event, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let frames = UnboundedReceiverStream::new(rx).map(Ok::<Event, Infallible>);

    Sse::new(announce.chain(frames)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

#[derive(Debug, Deserialize)]
struct ConnectionQuery {
    #[serde(rename = "connectionId")]
    connection_id: String,
}

async fn post_frame(
    State(state): State<Arc<ToolServerState>>,
    Query(q): Query<ConnectionQuery>,
    Json(frame): Json<Value>,
) -> impl IntoResponse {
    let request_id = frame.get("id").cloned();
    let response = process_frame(&state.ctx, &frame).await;

    if let Some(response) = response {
        let event = Event::default().event("message").data(response.to_string());
        let mut connections = state.connections.lock().await;
        if let Some(sender) = connections.get(&q.connection_id) {
            if sender.send(event).is_err() {
                connections.remove(&q.connection_id);
            }
        } else {
            return Json(json!({"accepted": false, "error": "unknown connectionId"}));
        }
    }

    Json(json!({"accepted": true, "id": request_id}))
}

/// Handles one JSON-RPC frame, returning the response frame to push over
/// the SSE stream. Notifications (no `id`) return `None`.
async fn process_frame(ctx: &Arc<AppContext>, frame: &Value) -> Option<Value> {
    let id = frame.get("id").cloned();
    let method = frame.get("method").and_then(Value::as_str).unwrap_or("");

    if id.is_none() {
        // JSON-RPC notifications (e.g. `initialized`) expect no reply.
        return None;
    }

    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "agentrelay", "version": env!("CARGO_PKG_VERSION")},
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({"tools": tools::relay_tools()})),
        "tools/call" => {
            let name = frame
                .get("params")
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let arguments = frame
                .get("params")
                .and_then(|p| p.get("arguments"))
                .cloned()
                .unwrap_or(json!({}));
            dispatch::dispatch(ctx, name, arguments).await
        }
        other => Err(anyhow::anyhow!("unknown method '{other}'")),
    };

    Some(match result {
        Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
        Err(e) => {
            let err = dispatch::classify_error(&e);
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": err.code, "message": err.message}})
        }
    })
}
