//! `GET /api/v1/openapi.json` — served as a static document, the way
//! `rest/openapi.rs` does it. `axum::Router` doesn't expose its route table for
//! introspection at runtime, so this mirrors that table as a literal kept
//! alongside `router()` in `rest/mod.rs` — update both when a route is
//! added or removed.

use axum::Json;
use serde_json::{json, Value};

pub async fn openapi_spec() -> Json<Value> {
    Json(json!({
        "openapi": "3.0.0",
        "info": {
            "title": "Agent Relay Core",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/api/v1/health": {"get": {"summary": "Liveness and basic counters"}},
            "/api/v1/metrics": {"get": {"summary": "Audit-derived counters"}},
            "/api/v1/openapi.json": {"get": {"summary": "This document"}},
            "/api/send": {"post": {"summary": "Send a message"}},
            "/api/inbox/{path}": {"get": {"summary": "Check an inbox"}},
            "/api/message/{id}": {"get": {"summary": "Fetch a message"}, "delete": {"summary": "Delete a message"}},
            "/api/receive/{id}": {"post": {"summary": "Mark a message read"}},
            "/api/complete/{id}": {"post": {"summary": "Mark a message completed"}},
            "/api/approve/{id}": {"post": {"summary": "Approve a pending message"}},
            "/api/status/{id}": {"post": {"summary": "Transition a message's status"}},
            "/api/threads": {"get": {"summary": "List threads"}},
            "/api/thread/{id}": {"get": {"summary": "Fetch one thread"}},
            "/api/files": {"post": {"summary": "Upload a blob"}},
            "/api/files/{id}": {"get": {"summary": "Download a blob"}},
            "/api/files/{id}/meta": {"get": {"summary": "Fetch blob metadata"}},
            "/api/webhooks": {"post": {"summary": "Subscribe"}, "get": {"summary": "List subscribers"}},
            "/api/webhooks/{id}": {"delete": {"summary": "Unsubscribe"}},
            "/api/agents": {"post": {"summary": "Register an agent"}, "get": {"summary": "List agents"}},
            "/api/agents/{platform}/{name}": {
                "get": {"summary": "Fetch an agent"},
                "put": {"summary": "Update an agent"},
                "delete": {"summary": "Delete an agent"},
            },
            "/api/agents/{platform}/{name}/ping": {"post": {"summary": "Mark an agent's last-seen"}},
            "/api/keys": {"post": {"summary": "Create an API key"}, "get": {"summary": "List API keys"}},
            "/api/keys/{id}": {"delete": {"summary": "Revoke an API key"}},
            "/api/v1/agent/journal": {"post": {"summary": "Journal a generic entry"}},
            "/api/v1/agent/thought": {"post": {"summary": "Journal a THOUGHT entry"}},
            "/api/v1/agent/error": {"post": {"summary": "Journal an ERROR entry"}},
            "/api/v1/agent/checkpoint": {"post": {"summary": "Journal a CHECKPOINT entry"}},
            "/api/v1/agent/context/{sessionId}": {"get": {"summary": "Context summary for a session"}},
            "/api/v1/agent/context/agent/{agentId}": {"get": {"summary": "Context summary for an agent"}},
            "/api/v1/agent/script/{agentId}": {"get": {"summary": "Resumption prompt for an agent"}},
            "/api/v1/agent/signin": {"post": {"summary": "Open/reuse a recorder session"}},
            "/bridge/relay": {"get": {"summary": "One-shot HTTP relay send+approve"}},
            "/bridge/send": {"post": {"summary": "One-shot HTTP relay send+approve (POST body)"}},
            "/bridge/agents": {"get": {"summary": "Online bridge agents"}},
            "/bridge/status": {"get": {"summary": "Bridge connection count"}},
        },
    }))
}
