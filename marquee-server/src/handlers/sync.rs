use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, header},
};
use marquee_core::{CacheKey, Completeness, FileDescriptor, KeyKind, SyncReport};
use serde::{Deserialize, Serialize};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub files: Vec<FileDescriptor>,
}

#[derive(Debug, Serialize)]
pub struct BlobSummary {
    pub key: CacheKey,
    pub content_type: String,
    pub size_bytes: u64,
    pub completeness: Completeness,
}

#[derive(Debug, Deserialize)]
pub struct RolloverRequest {
    pub generation: String,
}

#[derive(Debug, Serialize)]
pub struct RolloverResponse {
    pub generation: String,
    pub switched: bool,
}

/// PUT /_marquee/sync/required - Announce the required set and prefetch
/// anything missing.
pub async fn register_required_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> AppResult<Json<SyncReport>> {
    let report = state.sync.register(request.files).await?;
    Ok(Json(report))
}

/// PUT /_marquee/sync/blobs/{kind}/{id} - Store a complete blob.
pub async fn push_blob_handler(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<BlobSummary>> {
    let kind = KeyKind::parse(&kind)
        .ok_or_else(|| AppError::bad_request(format!("unknown blob kind '{kind}'")))?;
    if id.is_empty() {
        return Err(AppError::bad_request("blob id must not be empty"));
    }
    let key = CacheKey::new(kind, id);
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let record = state.sync.push_blob(&key, content_type, &body).await?;
    Ok(Json(BlobSummary {
        key: record.key,
        content_type: record.content_type,
        size_bytes: record.size_bytes,
        completeness: record.completeness,
    }))
}

/// POST /_marquee/sync/rollover - Switch cache generation, dropping the old one.
pub async fn rollover_handler(
    State(state): State<AppState>,
    Json(request): Json<RolloverRequest>,
) -> AppResult<Json<RolloverResponse>> {
    let switched = state.sync.rollover(&request.generation).await?;
    Ok(Json(RolloverResponse {
        generation: request.generation,
        switched,
    }))
}
