//! Health endpoint.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use serde::Serialize;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub entries: usize,
    pub sources: usize,
}

/// GET /-/health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state
        .engine
        .store()
        .health_check()
        .await
        .map_err(|e| ApiError::Storage(e.to_string()))?;

    let stats = state.engine.stats();
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        entries: stats.entries,
        sources: stats.sources,
    }))
}
