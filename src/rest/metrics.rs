//! `GET /api/v1/metrics` — ambient observability (SPEC_FULL §10), carried
//! regardless of the core spec's non-goals around metrics surfaces.
//! Counters are derived from the audit log rather than kept as separate
//! in-process atomics, so they survive a restart and never drift from
//! what actually happened (grounded on `rest/routes/metrics.rs`'s
//! pass-through-to-a-single-source-of-truth shape).

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppContext;

pub async fn get_metrics(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let stats = match ctx.audit.stats().await {
        Ok(s) => s,
        Err(e) => return Json(json!({"error": e.to_string()})),
    };

    let action_count = |action: &str| -> i64 {
        stats
            .top_actions
            .iter()
            .find(|(a, _)| a == action)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    };

    let webhook_failures: u32 = ctx.webhooks.list().await.iter().map(|s| s.failure_count).sum();
    let bridge_status = ctx.bridge.status().await;
    let archive_writes = ctx.archive.count().await.unwrap_or(0);

    Json(json!({
        "auditTotal": stats.total,
        "auditLast24h": stats.last_24h,
        "messagesSent": action_count("message.send"),
        "messagesApproved": action_count("message.approve"),
        "messagesStatusUpdated": action_count("message.status_update"),
        "messagesDeleted": action_count("message.delete"),
        "messagesExpired": action_count("message.expire"),
        "dispatcherAttempts": action_count("dispatcher.attempt"),
        "bridgeRelays": action_count("bridge-relay"),
        "webhookFailures": webhook_failures,
        "bridgeConnections": bridge_status["onlineCount"],
        "archiveWrites": archive_writes,
    }))
}
