//! Health check endpoint

use std::collections::BTreeMap;

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the Job Store cannot be read
    pub status: String,
    /// Module name ("vacal-jobs")
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// Jobs per status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<BTreeMap<&'static str, i64>>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);

    let jobs = match state.service.status_counts().await {
        Ok(counts) => Some(counts),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not read job counts");
            None
        }
    };

    Json(HealthResponse {
        status: if jobs.is_some() { "ok" } else { "degraded" }.to_string(),
        module: "vacal-jobs".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        jobs,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
