use axum::{Json, extract::State};
use marquee_core::FetcherStats;
use serde::Serialize;

use crate::infra::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub generation: String,
    pub required_files: usize,
    pub fetcher: FetcherStats,
}

/// GET /_marquee/health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        generation: state.cache.generation().await,
        required_files: state.required.len(),
        fetcher: state.router.fetcher().stats(),
    })
}
