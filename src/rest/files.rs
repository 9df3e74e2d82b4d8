//! File blob HTTP surface (§6, §4.C). Payload travels as base64 in the
//! JSON body on upload and as a raw byte stream on download, keeping
//! large payloads out of `Value`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::blobs::BlobType;
use crate::AppContext;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(msg: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": msg.into()})))
}

fn not_found(msg: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, Json(json!({"error": msg.into()})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadBody {
    pub name: String,
    pub content: String,
    #[serde(rename = "type", default = "default_blob_type")]
    pub blob_type: BlobType,
    pub mime_type: Option<String>,
}

fn default_blob_type() -> BlobType {
    BlobType::Data
}

pub async fn upload(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<UploadBody>,
) -> Result<Json<Value>, ApiError> {
    let payload = STANDARD
        .decode(body.content.as_bytes())
        .map_err(|e| bad_request(format!("content is not valid base64: {e}")))?;

    let meta = ctx
        .blobs
        .upload(body.name, payload, body.blob_type, body.mime_type)
        .await
        .map_err(|e| bad_request(e.to_string()))?;

    Ok(Json(serde_json::to_value(meta).unwrap_or(json!({}))))
}

pub async fn download(State(ctx): State<Arc<AppContext>>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let blob = ctx.blobs.get(&id).await.map_err(|e| not_found(e.to_string()))?;
    let content_type = blob.meta.mime.unwrap_or_else(|| "application/octet-stream".to_string());
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        blob.payload,
    )
        .into_response())
}

pub async fn meta(
    State(ctx): State<Arc<AppContext>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let meta = ctx.blobs.get_meta(&id).await.map_err(|e| not_found(e.to_string()))?;
    Ok(Json(serde_json::to_value(meta).unwrap_or(json!({}))))
}
