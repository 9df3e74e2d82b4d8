//! Bearer/query-token auth middleware (§6 "Auth").
//!
//! Keys look like `quack_<24 base64url chars>`. Accepted as either
//! `Authorization: Bearer <key>` or `?token=<key>`. `dev_bypass` grants
//! admin to every request without touching the key store, the same way
//! `rest/auth.rs` lets an empty configured token disable auth outright.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

use crate::AppContext;

fn extract_token(req: &Request) -> Option<String> {
    if let Some(v) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(v.to_string());
    }

    req.uri().query().and_then(|q| {
        url_query_param(q, "token")
    })
}

fn url_query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next()?;
        let v = parts.next().unwrap_or("");
        if k == key {
            Some(v.to_string())
        } else {
            None
        }
    })
}

pub async fn require_api_key(State(ctx): State<Arc<AppContext>>, req: Request, next: Next) -> Response {
    if ctx.config.dev_bypass {
        return next.run(req).await;
    }

    let token = match extract_token(&req) {
        Some(t) => t,
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "missing API key"})),
            )
                .into_response()
        }
    };

    match ctx.keys.authenticate(&token).await {
        Ok(_) => next.run(req).await,
        Err(_) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid or revoked API key"})),
        )
            .into_response(),
    }
}
