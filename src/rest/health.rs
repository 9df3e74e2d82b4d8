//! `GET /api/v1/health` — ambient operability endpoint (SPEC_FULL §10),
//! always present alongside a REST surface like this one (`rest/routes/health.rs`).

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppContext;

pub async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let mailbox_count = ctx.mailbox.all_messages().await.len();
    let bridge_status = ctx.bridge.status().await;
    let uptime_secs = (Utc::now() - ctx.started_at).num_seconds().max(0);

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
        "mailboxCount": mailbox_count,
        "bridgeConnections": bridge_status["onlineCount"],
    }))
}
