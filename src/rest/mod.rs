//! Public REST surface (§6) — one axum router serving the mailbox,
//! registry, blob, webhook, key, Flight Recorder, and bridge-pass-through
//! endpoints, plus the ambient health/metrics/openapi trio (SPEC_FULL
//! §10). Router-assembly shape follows `rest/mod.rs`, updated to axum
//! 0.8's `{param}` path syntax.

pub mod agents;
pub mod auth;
pub mod bridge;
pub mod files;
pub mod health;
pub mod keys;
pub mod mailbox;
pub mod metrics;
pub mod openapi;
pub mod recorder;
pub mod webhooks;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::toolserver;
use crate::AppContext;

pub fn router(ctx: Arc<AppContext>) -> Router {
    let protected = Router::new()
        .route("/api/send", post(mailbox::send))
        .route("/api/inbox/{*path}", get(mailbox::check_inbox))
        .route(
            "/api/message/{id}",
            get(mailbox::get_message).delete(mailbox::delete_message),
        )
        .route("/api/receive/{id}", post(mailbox::receive))
        .route("/api/complete/{id}", post(mailbox::complete))
        .route("/api/approve/{id}", post(mailbox::approve))
        .route("/api/status/{id}", post(mailbox::update_status))
        .route("/api/threads", get(mailbox::list_threads))
        .route("/api/thread/{id}", get(mailbox::get_thread))
        .route("/api/files", post(files::upload))
        .route("/api/files/{id}", get(files::download))
        .route("/api/files/{id}/meta", get(files::meta))
        .route(
            "/api/webhooks",
            post(webhooks::subscribe).get(webhooks::list),
        )
        .route("/api/webhooks/{id}", delete(webhooks::unsubscribe))
        .route("/api/agents", post(agents::create).get(agents::list))
        .route(
            "/api/agents/{platform}/{name}",
            get(agents::get).put(agents::update).delete(agents::delete),
        )
        .route("/api/agents/{platform}/{name}/ping", post(agents::ping))
        .route("/api/keys", post(keys::create).get(keys::list))
        .route("/api/keys/{id}", delete(keys::revoke))
        .route("/api/v1/agent/journal", post(recorder::journal))
        .route("/api/v1/agent/thought", post(recorder::thought))
        .route("/api/v1/agent/error", post(recorder::error))
        .route("/api/v1/agent/checkpoint", post(recorder::checkpoint))
        .route("/api/v1/agent/context/{sessionId}", get(recorder::context_for_session))
        .route(
            "/api/v1/agent/context/agent/{agentId}",
            get(recorder::context_for_agent),
        )
        .route("/api/v1/agent/script/{agentId}", get(recorder::script))
        .route("/api/v1/agent/signin", post(recorder::signin))
        .route("/api/v1/agent/session/new", post(recorder::new_session))
        .route("/api/v1/agent/session/{id}/close", post(recorder::close_session))
        .route(
            "/api/v1/agent/session/agent/{agentId}/close",
            post(recorder::close_agent_sessions),
        )
        .route("/bridge/relay", get(bridge::relay_get))
        .route("/bridge/send", post(bridge::relay_post))
        .route("/bridge/agents", get(bridge::agents))
        .route("/bridge/status", get(bridge::status))
        .route_layer(middleware::from_fn_with_state(ctx.clone(), auth::require_api_key));

    let public = Router::new()
        .route("/api/v1/health", get(health::health))
        .route("/api/v1/metrics", get(metrics::get_metrics))
        .route("/api/v1/openapi.json", get(openapi::openapi_spec));

    let api = Router::new().merge(public).merge(protected).with_state(ctx.clone());

    Router::new()
        .merge(api)
        .merge(toolserver::router(ctx))
        .layer(CorsLayer::permissive())
}
